use std::io::Write;
use std::sync::Arc;

use blockseek::idxdefl::{compress_file, compress_stream, EncodeOptions};
use blockseek::{Archive, ArchiveOptions, Error, ReadAt};
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

fn pseudo_random(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut i = 0u64;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(i.to_le_bytes());
        out.extend_from_slice(&hasher.finalize());
        i += 1;
    }
    out.truncate(len);
    out
}

fn compressible(len: usize) -> Vec<u8> {
    pseudo_random(len).iter().map(|b| b % 16).collect()
}

fn encode(data: &[u8], block_size: u32) -> Vec<u8> {
    let mut out = Vec::new();
    compress_stream(
        &mut &data[..],
        &mut out,
        EncodeOptions {
            block_size,
            level: 7,
        },
    )
    .unwrap();
    out
}

fn open_mem(container: Vec<u8>) -> Archive {
    Archive::with_source(Arc::new(container), ArchiveOptions::default()).unwrap()
}

#[test]
fn small_plaintext_with_tiny_blocks() {
    // "ABCDEFGHIJ" at block size 4 splits into "ABCD", "EFGH", "IJ".
    let archive = open_mem(encode(b"ABCDEFGHIJ", 4));
    assert_eq!(archive.uncompressed_size(), 10);

    let mut reader = archive.reader();
    let mut buf = [0u8; 5];
    reader.read_into(3, &mut buf).unwrap();
    assert_eq!(&buf, b"DEFGH");
}

#[test]
fn read_across_the_block_seam() {
    let mut data = vec![0x00u8; 64 * 1024];
    data.extend_from_slice(&vec![0xFFu8; 64 * 1024]);
    let archive = open_mem(encode(&data, 64 * 1024));

    let mut reader = archive.reader();
    let mut buf = [0u8; 2];
    reader.read_into(65535, &mut buf).unwrap();
    assert_eq!(buf, [0x00, 0xFF]);
}

#[test]
fn roundtrip_at_awkward_block_sizes() {
    let small = compressible(3000);
    let large = compressible(150_000);

    for (data, block_size) in [
        (&small, 1u32),
        (&large, 7),
        (&large, 64 * 1024),
        (&large, large.len() as u32),
    ] {
        let archive = open_mem(encode(data, block_size));
        assert_eq!(archive.uncompressed_size(), data.len() as u64);

        let mut reader = archive.reader();
        let mut out = vec![0u8; data.len()];
        reader.read_into(0, &mut out).unwrap();
        assert_eq!(&out, data, "block_size {block_size}");
    }
}

#[test]
fn chunked_views_reassemble_the_file() {
    let data = pseudo_random(10_000);
    let archive = open_mem(encode(&data, 512));
    let mut reader = archive.reader();

    let mut out = Vec::new();
    let mut pos = 0u64;
    while pos < data.len() as u64 {
        let view = reader.read(pos, 13).unwrap();
        assert!(!view.is_empty());
        out.extend_from_slice(view);
        pos += view.len() as u64;
    }
    assert_eq!(out, data);
}

#[test]
fn reads_are_deterministic_regardless_of_history() {
    let data = pseudo_random(64 * 1024);
    let archive = open_mem(encode(&data, 512));
    let mut reader = archive.reader();

    let mut rng = rand_pcg::Pcg64::seed_from_u64(1);
    for _ in 0..200 {
        let offset = rng.gen_range(0..data.len() as u64);
        let len = rng.gen_range(1..=(data.len() as u64 - offset).min(2048)) as usize;
        let mut buf = vec![0u8; len];
        reader.read_into(offset, &mut buf).unwrap();
        assert_eq!(&buf, &data[offset as usize..offset as usize + len]);
    }
}

#[test]
fn rewind_and_jump_back() {
    let data = pseudo_random(1_200_000);
    let archive = open_mem(encode(&data, 4096));
    let mut reader = archive.reader();

    let mut first = [0u8; 16];
    reader.read_into(1_000_000, &mut first).unwrap();
    let mut head = [0u8; 16];
    reader.read_into(0, &mut head).unwrap();
    let mut again = [0u8; 16];
    reader.read_into(1_000_000, &mut again).unwrap();

    assert_eq!(first, again);
    assert_eq!(&head, &data[..16]);
    assert_eq!(&first, &data[1_000_000..1_000_016]);
}

#[test]
fn forward_reads_continue_where_the_last_ended() {
    let data = pseudo_random(8192);
    let archive = open_mem(encode(&data, 1024));
    let mut reader = archive.reader();

    let mut combined = vec![0u8; 3000];
    reader.read_into(100, &mut combined).unwrap();

    let mut reader2 = archive.reader();
    let mut a = vec![0u8; 1300];
    let mut b = vec![0u8; 1700];
    reader2.read_into(100, &mut a).unwrap();
    reader2.read_into(1400, &mut b).unwrap();

    assert_eq!(&combined[..1300], &a[..]);
    assert_eq!(&combined[1300..], &b[..]);
}

#[test]
fn out_of_range_requests_are_rejected() {
    let archive = open_mem(encode(b"ABCDEFGHIJ", 4));
    let mut reader = archive.reader();
    let size = archive.uncompressed_size();

    let mut one = [0u8; 1];
    assert!(matches!(
        reader.read_into(size, &mut one),
        Err(Error::OutOfRange(_))
    ));
    let mut oversized = vec![0u8; size as usize + 1];
    assert!(matches!(
        reader.read_into(0, &mut oversized),
        Err(Error::OutOfRange(_))
    ));
    assert!(matches!(
        reader.read_into(u64::MAX, &mut one),
        Err(Error::OutOfRange(_))
    ));
    assert!(matches!(reader.read(size, 1), Err(Error::OutOfRange(_))));

    // Zero-length requests inside the file are fine.
    reader.read_into(0, &mut []).unwrap();
}

#[test]
fn corrupt_footer_fails_open() {
    let mut container = encode(&pseudo_random(5000), 512);
    let len = container.len();
    // Top byte of index_size.
    container[len - 16] = 0xFF;
    let err = Archive::with_source(Arc::new(container), ArchiveOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CorruptContainer(_)));
}

#[test]
fn footer_block_count_must_match_the_index() {
    let mut container = encode(&pseudo_random(5000), 512);
    let len = container.len();
    let declared = u32::from_be_bytes(container[len - 8..len - 4].try_into().unwrap());
    container[len - 8..len - 4].copy_from_slice(&(declared + 1).to_be_bytes());
    let err = Archive::with_source(Arc::new(container), ArchiveOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CorruptContainer(_)));
}

#[test]
fn bogus_payload_behind_valid_magic_fails_open() {
    let mut container = b"idxdefl\0".to_vec();
    container.extend_from_slice(&[0x5A; 64]);
    let err = Archive::with_source(Arc::new(container), ArchiveOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CorruptContainer(_)));
}

#[test]
fn failed_read_leaves_the_reader_usable() {
    let data = pseudo_random(3 * 512);
    let (mut container, offsets) = build_with_flate2(&data, 512);

    // Zero out the middle block. A zeroed stream parses as a stored block
    // whose length check cannot pass, so decoding it always fails.
    container[offsets[1]..offsets[2]].fill(0);

    let archive = open_mem(container);
    let mut reader = archive.reader();

    let mut mid = [0u8; 8];
    assert!(matches!(
        reader.read_into(600, &mut mid),
        Err(Error::Decode(_))
    ));

    // The index and provider survive; the other blocks still read fine.
    let mut head = [0u8; 512];
    reader.read_into(0, &mut head).unwrap();
    assert_eq!(&head[..], &data[..512]);
    let mut tail = [0u8; 512];
    reader.read_into(1024, &mut tail).unwrap();
    assert_eq!(&tail[..], &data[1024..]);
}

#[test]
fn closed_reader_reports_not_open() {
    let archive = open_mem(encode(b"ABCDEFGHIJ", 4));
    let mut reader = archive.reader();
    reader.close();

    let mut buf = [0u8; 1];
    assert!(matches!(reader.read_into(0, &mut buf), Err(Error::NotOpen)));
    assert!(matches!(reader.uncompressed_size(), Err(Error::NotOpen)));
}

#[test]
fn integer_array_adapter_byteswaps() {
    let values: Vec<u32> = (0..256).map(|i| 0x0102_0304u32.wrapping_mul(i)).collect();
    let mut data = Vec::new();
    for v in &values {
        data.extend_from_slice(&v.to_be_bytes());
    }

    let archive = open_mem(encode(&data, 64));
    let mut reader = archive.reader();
    assert_eq!(reader.read_u32s_be(0, 256).unwrap(), values);
    assert_eq!(reader.read_u32s_be(4 * 10, 3).unwrap(), &values[10..13]);
}

/// Build a container with flate2 instead of the crate's own encoder.
/// Returns the bytes plus each block's start offset (and the index start as
/// the final element).
fn build_with_flate2(data: &[u8], block_size: usize) -> (Vec<u8>, Vec<usize>) {
    let deflate = |payload: &[u8]| {
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::new(6));
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    };

    let mut container = b"idxdefl\0".to_vec();
    let mut offsets = Vec::new();
    let mut index = Vec::new();
    let chunks: Vec<&[u8]> = data.chunks(block_size).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let compressed = deflate(chunk);
        if i + 1 < chunks.len() {
            index.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        }
        offsets.push(container.len());
        container.extend_from_slice(&compressed);
    }
    offsets.push(container.len());

    let compressed_index = deflate(&index);
    container.extend_from_slice(&compressed_index);
    for field in [
        compressed_index.len() as u32,
        block_size as u32,
        (chunks.len() - 1) as u32,
        chunks.last().unwrap().len() as u32,
    ] {
        container.extend_from_slice(&field.to_be_bytes());
    }
    (container, offsets)
}

/// Decode a container produced by an independent DEFLATE implementation.
#[test]
fn reads_a_container_written_with_flate2() {
    let data = compressible(9000);
    let (container, _) = build_with_flate2(&data, 2048);
    let archive = open_mem(container);
    assert_eq!(archive.uncompressed_size(), data.len() as u64);
    let mut reader = archive.reader();
    let mut out = vec![0u8; data.len()];
    reader.read_into(0, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn compress_file_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("payload.bin");
    std::fs::write(&input, pseudo_random(10_000)).unwrap();

    let output = compress_file(&input, EncodeOptions::default()).unwrap();
    assert_eq!(output, dir.path().join("payload.bin.idxdefl"));

    let archive = Archive::open(&output).unwrap();
    assert_eq!(archive.uncompressed_size(), 10_000);

    assert!(matches!(
        compress_file(&input, EncodeOptions::default()),
        Err(Error::Io(_))
    ));
}

#[test]
fn mmap_and_pread_providers_agree() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("payload.bin");
    let data = pseudo_random(50_000);
    std::fs::write(&input, &data).unwrap();
    let path = compress_file(
        &input,
        EncodeOptions {
            block_size: 4096,
            level: 7,
        },
    )
    .unwrap();

    let mut pread = Archive::open(&path).unwrap().reader();
    let mut mapped = Archive::open_mmap(&path).unwrap().reader();

    let mut a = vec![0u8; 1000];
    let mut b = vec![0u8; 1000];
    pread.read_into(30_000, &mut a).unwrap();
    mapped.read_into(30_000, &mut b).unwrap();
    assert_eq!(a, b);
    assert_eq!(&a, &data[30_000..31_000]);
}

#[test]
fn in_memory_provider_size_checks() {
    let container = encode(b"ABCDEFGHIJ", 4);
    let source: Arc<dyn ReadAt> = Arc::new(container.clone());
    assert_eq!(source.size(), container.len() as u64);

    let mut buf = vec![0u8; container.len() + 1];
    assert!(matches!(
        source.read_exact_at(0, &mut buf),
        Err(Error::OutOfRange(_))
    ));
}
