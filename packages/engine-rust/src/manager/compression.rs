//! Payload compression for the manager's send and delivery paths.

use std::io::{Read, Write};

use quiver_core::{CompressionAlgorithm, QueueError, QueueResult};

/// Compresses `data` with the given algorithm.
///
/// `level` applies to GZIP and ZSTD (clamped to 1..=9); LZ4 and Snappy
/// have a single speed profile.
pub fn compress(
    algorithm: CompressionAlgorithm,
    level: u32,
    data: &[u8],
) -> QueueResult<Vec<u8>> {
    let level = level.clamp(1, 9);
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(
                Vec::with_capacity(data.len() / 2 + 16),
                flate2::Compression::new(level),
            );
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|e| QueueError::CompressionFailed(format!("gzip: {e}")))
        }
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd => {
            zstd::encode_all(data, i32::try_from(level).unwrap_or(3))
                .map_err(|e| QueueError::CompressionFailed(format!("zstd: {e}")))
        }
        CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| QueueError::CompressionFailed(format!("snappy: {e}"))),
    }
}

/// Inverts [`compress`]. `original_size` bounds the output allocation for
/// formats that do not carry their own length.
pub fn decompress(
    algorithm: CompressionAlgorithm,
    data: &[u8],
    original_size: usize,
) -> QueueResult<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::with_capacity(original_size);
            decoder
                .read_to_end(&mut out)
                .map(|_| out)
                .map_err(|e| QueueError::CompressionFailed(format!("gunzip: {e}")))
        }
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| QueueError::CompressionFailed(format!("lz4: {e}"))),
        CompressionAlgorithm::Zstd => zstd::decode_all(data)
            .map_err(|e| QueueError::CompressionFailed(format!("unzstd: {e}"))),
        CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| QueueError::CompressionFailed(format!("unsnappy: {e}"))),
    }
}

/// Wire name for the algorithm, stamped into message properties.
#[must_use]
pub fn algorithm_name(algorithm: CompressionAlgorithm) -> &'static str {
    match algorithm {
        CompressionAlgorithm::None => "NONE",
        CompressionAlgorithm::Gzip => "GZIP",
        CompressionAlgorithm::Lz4 => "LZ4",
        CompressionAlgorithm::Zstd => "ZSTD",
        CompressionAlgorithm::Snappy => "SNAPPY",
    }
}

/// Inverts [`algorithm_name`].
pub fn algorithm_from_name(name: &str) -> QueueResult<CompressionAlgorithm> {
    match name {
        "NONE" => Ok(CompressionAlgorithm::None),
        "GZIP" => Ok(CompressionAlgorithm::Gzip),
        "LZ4" => Ok(CompressionAlgorithm::Lz4),
        "ZSTD" => Ok(CompressionAlgorithm::Zstd),
        "SNAPPY" => Ok(CompressionAlgorithm::Snappy),
        other => Err(QueueError::CompressionFailed(format!(
            "unknown compression algorithm {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] =
        b"the quick brown fox jumps over the lazy dog, repeatedly and compressibly, \
          the quick brown fox jumps over the lazy dog";

    #[test]
    fn every_algorithm_round_trips() {
        for algorithm in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            let compressed = compress(algorithm, 6, SAMPLE).unwrap();
            let restored = decompress(algorithm, &compressed, SAMPLE.len()).unwrap();
            assert_eq!(restored, SAMPLE, "{algorithm:?}");
        }
    }

    #[test]
    fn real_algorithms_shrink_repetitive_data() {
        let data = b"abcabcabc".repeat(200);
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            let compressed = compress(algorithm, 6, &data).unwrap();
            assert!(compressed.len() < data.len() / 2, "{algorithm:?}");
        }
    }

    #[test]
    fn corrupt_input_fails_cleanly() {
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            let result = decompress(algorithm, b"\x01\x02garbage\xff", 64);
            assert!(
                matches!(result, Err(QueueError::CompressionFailed(_))),
                "{algorithm:?}"
            );
        }
    }

    #[test]
    fn names_round_trip() {
        for algorithm in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            assert_eq!(
                algorithm_from_name(algorithm_name(algorithm)).unwrap(),
                algorithm
            );
        }
        assert!(algorithm_from_name("BROTLI").is_err());
    }

    #[test]
    fn empty_payload_round_trips() {
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            let compressed = compress(algorithm, 1, b"").unwrap();
            assert_eq!(decompress(algorithm, &compressed, 0).unwrap(), b"");
        }
    }
}
