fn main() {
    println!("Run `cargo test -p replay-compat` to execute transfer list replay tests.");
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Cursor;
    use std::os::unix::fs::FileExt;
    use std::path::Path;
    use std::sync::Arc;

    use updatekit_blockset::{BLOCK_SIZE, checksum_bytes};
    use updatekit_package::MemoryPackage;
    use updatekit_patch::{
        DeflateParams, ImagePatchBuilder, apply_image_patch, compress_deflate,
        generate_block_patch,
    };
    use updatekit_transfer::{
        MemorySink, PackageMembers, ProgressReporter, ScriptInputs, TransferError,
        TransferOptions, TransferSession, TransferSummary,
    };

    const BS: usize = BLOCK_SIZE as usize;
    const BLOCKS: usize = 16;

    /// Parses but cannot apply: neither its target nor its source matches.
    fn failing_line() -> String {
        format!("move {} 2,15,16 1 2,15,16", "00".repeat(32))
    }

    fn block(image: &[u8], n: usize) -> &[u8] {
        &image[n * BS..(n + 1) * BS]
    }

    fn blocks(image: &[u8], start: usize, end: usize) -> &[u8] {
        &image[start * BS..end * BS]
    }

    fn pattern_block(n: usize) -> Vec<u8> {
        (0..BS)
            .map(|j| ((j * 7 + n * 131 + (j >> 5)) % 253) as u8)
            .collect()
    }

    fn text(tag: &str, lines: usize) -> Vec<u8> {
        (0..lines)
            .map(|n| format!("{tag} record {n:04} checksum {:08x}\n", n * 2654435761usize))
            .collect::<String>()
            .into_bytes()
    }

    /// An old image, the transfer list turning it into a new image, and the
    /// data the list reads.
    struct Scenario {
        old: Vec<u8>,
        expected: Vec<u8>,
        lines: Vec<String>,
        new_data: Vec<u8>,
        patch_data: Vec<u8>,
    }

    impl Scenario {
        fn build() -> Self {
            let params = DeflateParams::raw(6);

            let mut old: Vec<u8> = (0..BLOCKS).flat_map(pattern_block).collect();
            // Blocks 9..11 hold a raw block followed by a deflate member.
            let member = compress_deflate(params, &text("old", 120)).unwrap();
            assert!(member.len() < BS);
            let member_range = 10 * BS..10 * BS + member.len();
            old[10 * BS..11 * BS].fill(0);
            old[member_range].copy_from_slice(&member);

            let mut expected = old.clone();
            let new_data: Vec<u8> = (0..3 * BS).map(|i| (i * 13 % 256) as u8).collect();
            expected[..2 * BS].copy_from_slice(&new_data[..2 * BS]);
            expected[2 * BS..4 * BS].fill(0);
            expected[4 * BS..7 * BS].copy_from_slice(blocks(&old, 5, 8));

            let mut n7 = block(&old, 8).to_vec();
            for i in (0..BS).step_by(512) {
                n7[i] ^= 0xff;
            }
            n7[1000..1100].reverse();
            expected[7 * BS..8 * BS].copy_from_slice(&n7);
            expected[8 * BS..9 * BS].copy_from_slice(&new_data[2 * BS..]);

            // Image patch: rewritten raw block, literal padding, new member.
            let old_window = blocks(&old, 9, 11);
            let mut head = block(&old, 9).to_vec();
            head[..64].fill(0x5a);
            let src_member = BS as u64..(BS + member.len()) as u64;
            let payload = text("new", 130);
            let build_image_patch = |padding: usize| {
                let mut builder = ImagePatchBuilder::new();
                builder.normal(old_window, 0..BS as u64, &head).unwrap();
                builder.raw(&vec![0xa5; padding]);
                builder
                    .deflate(old_window, src_member.clone(), params, &payload)
                    .unwrap();
                builder.build()
            };
            let mut unpadded = Vec::new();
            apply_image_patch(&build_image_patch(0), old_window, &mut unpadded).unwrap();
            assert!(unpadded.len() < 2 * BS);
            let image_patch = build_image_patch(2 * BS - unpadded.len());
            let mut n9_10 = Vec::new();
            apply_image_patch(&image_patch, old_window, &mut n9_10).unwrap();
            assert_eq!(n9_10.len(), 2 * BS);
            expected[9 * BS..11 * BS].copy_from_slice(&n9_10);

            expected[11 * BS..12 * BS].copy_from_slice(block(&old, 13));
            let mut n12 = block(&old, 11).to_vec();
            n12[2048..2304].fill(0x11);
            expected[12 * BS..13 * BS].copy_from_slice(&n12);
            expected[14 * BS..15 * BS].fill(0);

            let bsdiff_patch = generate_block_patch(block(&old, 8), &n7).unwrap();
            let pkgdiff_patch = generate_block_patch(block(&old, 11), &n12).unwrap();
            let mut patch_data = Vec::new();
            let mut window = |patch: &[u8]| {
                let offset = patch_data.len();
                patch_data.extend_from_slice(patch);
                format!("{offset} {}", patch.len())
            };
            let bsdiff_window = window(&bsdiff_patch);
            let imgdiff_window = window(&image_patch);
            let pkgdiff_window = window(&pkgdiff_patch);

            let h8 = checksum_bytes(block(&old, 8));
            let lines = vec![
                "4".to_string(),
                BLOCKS.to_string(),
                "2".to_string(),
                "4".to_string(),
                format!("stash {h8} 2,8,9"),
                "new 2,0,2".to_string(),
                "zero 2,2,4".to_string(),
                format!("move {} 2,4,7 3 2,5,8", checksum_bytes(blocks(&old, 5, 8))),
                "new 2,8,9".to_string(),
                format!(
                    "bsdiff {bsdiff_window} {h8} {} 2,7,8 1 - {h8}:2,0,1",
                    checksum_bytes(&n7)
                ),
                format!("free {h8}"),
                format!(
                    "imgdiff {imgdiff_window} {} {} 2,9,11 2 2,9,11",
                    checksum_bytes(old_window),
                    checksum_bytes(&n9_10)
                ),
                format!(
                    "pkgdiff {pkgdiff_window} {} {} 2,12,13 1 2,11,12",
                    checksum_bytes(block(&old, 11)),
                    checksum_bytes(&n12)
                ),
                format!("copy {} 2,11,12 1 2,13,14", checksum_bytes(block(&old, 13))),
                "erase 2,14,15".to_string(),
                "abort".to_string(),
                "frobnicate 1 2 3".to_string(),
                format!("move {} 2,15,16 1 2,15,16", checksum_bytes(block(&old, 15))),
            ];

            Self {
                old,
                expected,
                lines,
                new_data,
                patch_data,
            }
        }

        fn command_count(&self) -> usize {
            self.lines.len() - 4
        }

        /// The list with command `index` replaced by one that fails.
        fn broken_at(&self, index: usize) -> Vec<String> {
            let mut lines = self.lines.clone();
            lines[4 + index] = failing_line();
            lines
        }

        fn inputs(&self) -> ScriptInputs {
            ScriptInputs {
                patch_data: self.patch_data.clone(),
                new_data: Some(Box::new(Cursor::new(self.new_data.clone()))),
            }
        }

        fn device(&self, dir: &Path) -> File {
            let path = dir.join("system.img");
            std::fs::write(&path, &self.old).unwrap();
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .unwrap()
        }
    }

    fn contents(file: &File) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCKS * BS];
        file.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    fn session(work: &Path, retry: bool, can_write: bool) -> (TransferSession, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let mut options = TransferOptions::new("system", work);
        options.retry = retry;
        options.can_write = can_write;
        options.allow_file_erase = true;
        (TransferSession::new(options, ProgressReporter::new(sink.clone())), sink)
    }

    fn run(
        work: &Path,
        target: &File,
        lines: &[String],
        scenario: &Scenario,
        retry: bool,
    ) -> Result<TransferSummary, TransferError> {
        session(work, retry, true)
            .0
            .run_script(target, lines, scenario.inputs())
    }

    #[test]
    fn uninterrupted_run_produces_new_image() {
        let scenario = Scenario::build();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let target = scenario.device(tmp.path());

        let (session, sink) = session(&work, false, true);
        let summary = session
            .run_script(&target, &scenario.lines, scenario.inputs())
            .unwrap();

        assert_eq!(contents(&target), scenario.expected);
        // Every line but the unknown verb runs.
        assert_eq!(summary.executed, scenario.command_count() - 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.blocks_written, 13);

        assert!(!session.options().marker_path().exists());
        assert!(!session.options().stash_dir().exists());
        assert!(!sink.topic("set_progress").is_empty());
    }

    #[test]
    fn resume_after_failure_at_every_command() {
        let scenario = Scenario::build();

        for index in 0..scenario.command_count() {
            let tmp = tempfile::tempdir().unwrap();
            let work = tmp.path().join("work");
            let target = scenario.device(tmp.path());

            let err = run(&work, &target, &scenario.broken_at(index), &scenario, false).unwrap_err();
            assert!(
                matches!(err, TransferError::CommandFailed { index: i, .. } if i == index),
                "command {index}: {err}"
            );

            let summary = run(&work, &target, &scenario.lines, &scenario, true)
                .unwrap_or_else(|e| panic!("resume after command {index}: {e}"));
            assert_eq!(contents(&target), scenario.expected, "resume after command {index}");
            assert!(!work.join("system.retry.json").exists());
            assert!(summary.skipped <= index);
        }
    }

    #[test]
    fn interrupted_run_keeps_marker_and_stash() {
        let scenario = Scenario::build();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let target = scenario.device(tmp.path());

        // Fail the bsdiff that reads the stashed block.
        run(&work, &target, &scenario.broken_at(5), &scenario, false).unwrap_err();

        let marker = std::fs::read_to_string(work.join("system.retry.json")).unwrap();
        assert!(marker.contains("\"index\":3"), "{marker}");
        let h8 = checksum_bytes(block(&scenario.old, 8));
        assert!(work.join("system_tmp").join(&h8).is_file());

        let summary = run(&work, &target, &scenario.lines, &scenario, true).unwrap();
        // stash, zero and move are not repeated.
        assert_eq!(summary.skipped, 3);
        assert_eq!(contents(&target), scenario.expected);
        assert!(!work.join("system_tmp").join(&h8).exists());
    }

    #[test]
    fn resumed_run_twice_is_stable() {
        let scenario = Scenario::build();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let target = scenario.device(tmp.path());

        run(&work, &target, &scenario.broken_at(8), &scenario, false).unwrap_err();
        run(&work, &target, &scenario.broken_at(10), &scenario, true).unwrap_err();
        run(&work, &target, &scenario.lines, &scenario, true).unwrap();
        assert_eq!(contents(&target), scenario.expected);
    }

    #[test]
    fn dry_run_checks_without_writing() {
        let scenario = Scenario::build();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let target = scenario.device(tmp.path());

        let (session, _sink) = session(&work, false, false);
        session
            .run_script(&target, &scenario.lines, scenario.inputs())
            .unwrap();
        assert_eq!(contents(&target), scenario.old);
    }

    #[test]
    fn replay_from_package_members() {
        let scenario = Scenario::build();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let target = scenario.device(tmp.path());

        let mut package = MemoryPackage::new();
        package
            .insert("system.transfer.list", scenario.lines.join("\n"))
            .insert("system.new.dat", scenario.new_data.clone())
            .insert("system.patch.dat", scenario.patch_data.clone());
        let members = PackageMembers {
            transfer_list: "system.transfer.list".into(),
            new_data: Some("system.new.dat".into()),
            patch_data: Some("system.patch.dat".into()),
        };

        let (session, _sink) = session(&work, false, true);
        session.run_package(&target, &package, &members).unwrap();
        assert_eq!(contents(&target), scenario.expected);
    }

    #[test]
    fn stash_limit_is_enforced() {
        let scenario = Scenario::build();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let target = scenario.device(tmp.path());

        // One block of stash cannot hold the overlapping three block move.
        let mut lines = scenario.lines.clone();
        lines[3] = "1".to_string();
        let err = run(&work, &target, &lines, &scenario, false).unwrap_err();
        assert!(matches!(err, TransferError::CommandFailed { index: 3, .. }), "{err}");
    }
}
