use super::*;

use std::fs;

fn histogram_of(bytes: &[u8]) -> ByteHistogram {
    let mut histogram = ByteHistogram::new();
    histogram.record_slice(bytes);
    histogram
}

#[test]
fn default_output_path_appends_suffix() {
    assert_eq!(
        default_output_path("photos"),
        PathBuf::from("photos.compressed")
    );
}

#[test]
fn password_validation_rejects_bad_inputs() {
    assert!(matches!(
        validate_password(""),
        Err(ArchiveError::InvalidPassword("must not be empty"))
    ));
    assert!(matches!(
        validate_password("with space"),
        Err(ArchiveError::InvalidPassword("must not contain whitespace"))
    ));
    let long = "x".repeat(MAX_PASSWORD_LEN + 1);
    assert!(matches!(
        validate_password(&long),
        Err(ArchiveError::InvalidPassword(_))
    ));
    assert!(validate_password("secret").is_ok());

    let options = ArchiveOptions {
        password: Some(String::new()),
        ..ArchiveOptions::default()
    };
    assert!(Archiver::init(options).is_err());
}

#[test]
fn guided_queue_hands_out_every_index_exactly_once() {
    let queue = GuidedQueue::new(100, 4);
    let mut seen = Vec::new();
    let mut first_chunk = None;
    while let Some(range) = queue.take() {
        if first_chunk.is_none() {
            first_chunk = Some(range.len());
        }
        seen.extend(range);
    }
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    // 100 items over 4 workers: the first grab takes 100 / 8.
    assert_eq!(first_chunk, Some(12));

    let queue = GuidedQueue::new(3, 8);
    let mut seen = Vec::new();
    while let Some(range) = queue.take() {
        assert_eq!(range.len(), 1);
        seen.extend(range);
    }
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn header_carries_the_password_block_verbatim() {
    let book = build_code_book(&histogram_of(b"aaabbc")).expect("build");
    let with_password = encode_header(&book, Some("secret"), 1).expect("header");
    let without_password = encode_header(&book, None, 1).expect("header");

    assert_eq!(with_password[1], 6);
    assert_eq!(&with_password[2..8], b"secret");
    assert_eq!(without_password[1], 0);
    // The password block shifts the remainder without changing it.
    assert_eq!(with_password[0], without_password[0]);
    assert_eq!(&with_password[8..], &without_password[2..]);
}

#[test]
fn header_letter_count_wraps_at_256() {
    let mut histogram = ByteHistogram::new();
    for value in 0..=255u8 {
        histogram.record(value);
    }
    let book = build_code_book(&histogram).expect("build");
    let header = encode_header(&book, None, 1).expect("header");
    assert_eq!(header[0], 0, "256 distinct bytes store a zero letter count");
}

#[test]
fn top_level_file_record_layout_is_bit_exact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("zeros.bin");
    fs::write(&path, [0x00, 0x00, 0x00]).expect("write input");

    // 0xFF(1) sorts first and takes the `1` branch; 0x00 encodes as a single 0.
    let mut histogram = histogram_of(&[0x00, 0x00, 0x00]);
    histogram.record(0xFF);
    let book = build_code_book(&histogram).expect("build");
    assert_eq!(
        book.code(0x00),
        Some(huffpack_huffman::Code { bits: 0, len: 1 })
    );

    let mut read_buffer = vec![0u8; 64];
    let record = encode_top_level(&path, &book, &mut read_buffer, None)
        .expect("encode")
        .expect("file should not be skipped");

    // marker 1, 64-bit size 3, three 0-bits of content, zero padding.
    assert_eq!(record, vec![0x80, 0, 0, 0, 0, 0, 0, 0x01, 0x80]);
}

#[test]
fn unreadable_top_level_input_is_elided() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("missing.bin");
    let book = build_code_book(&histogram_of(b"x")).expect("build");

    let mut read_buffer = vec![0u8; 64];
    let record =
        encode_top_level(&path, &book, &mut read_buffer, None).expect("skip is not fatal");
    assert!(record.is_none());
}

#[test]
fn analyze_charges_the_documented_bit_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sample.bin");
    fs::write(&path, b"ABACAB").expect("write input");
    let input = path.to_str().expect("utf-8 path").to_string();

    let archiver = Archiver::init(ArchiveOptions::default()).expect("init");
    let plan = archiver.analyze(std::slice::from_ref(&input)).expect("analyze");

    let mut histogram = histogram_of(input.as_bytes());
    histogram.record_slice(b"ABACAB");
    let book = build_code_book(&histogram).expect("build");

    // file count + per-input overhead + size field + letter count +
    // password length byte + table + payload.
    let expected =
        16 + 9 + 64 + 8 + 8 + book.table_bits() + book.payload_bits();
    assert_eq!(plan.estimated_bits(), expected);
    assert_eq!(plan.input_bytes(), 6);
    assert_eq!(plan.file_count(), 1);
    assert_eq!(plan.root_weight(), histogram.total());
    assert_eq!(plan.estimated_bytes(), expected.div_ceil(8));
}

#[test]
fn analyze_rejects_missing_inputs() {
    let archiver = Archiver::init(ArchiveOptions::default()).expect("init");
    assert!(matches!(
        archiver.analyze(&[]),
        Err(ArchiveError::MissingInputs)
    ));

    let missing = vec!["/no/such/path/exists".to_string()];
    assert!(matches!(
        archiver.analyze(&missing),
        Err(ArchiveError::MissingInputFile(_))
    ));
}

#[test]
fn folder_scan_budget_counts_children_and_names() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("tree");
    fs::create_dir(&root).expect("mkdir");
    fs::write(root.join("x"), b"xxx").expect("write x");
    fs::create_dir(root.join("d")).expect("mkdir d");

    let mut local = Collected::default();
    let mut read_buffer = vec![0u8; 64];
    scan_input(&root, &mut local, &mut read_buffer).expect("scan");

    // Outer dir: 4096 + 16 bits; two entries at 9 bits each; file x: size
    // field and 3 content bytes; empty subdir d: 4096 + 16 bits.
    assert_eq!(local.total_size, 4096 + 3 + 4096);
    assert_eq!(local.bit_budget, 16 + 9 + 9 + 64 + 16);
    assert_eq!(local.histogram.count(b'x'), 4);
    assert_eq!(local.histogram.count(b'd'), 1);
}
