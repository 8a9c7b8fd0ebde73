use md5::Md5;
use sha2::{Digest, Sha256, Sha512};

use crate::domain::media::ChecksumAlgorithm;

/// Incremental digest fed chunk by chunk during a single streaming pass.
#[derive(Clone)]
pub struct ChecksumStream {
    algorithm: ChecksumAlgorithm,
    state: DigestState,
    bytes_seen: u64,
}

#[derive(Clone)]
enum DigestState {
    Sha256(Sha256),
    Sha512(Sha512),
    Md5(Md5),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
    pub bytes: u64,
}

impl ChecksumStream {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let state = match algorithm {
            ChecksumAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => DigestState::Sha512(Sha512::new()),
            ChecksumAlgorithm::Md5 => DigestState::Md5(Md5::new()),
        };
        Self {
            algorithm,
            state,
            bytes_seen: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match &mut self.state {
            DigestState::Sha256(hasher) => hasher.update(chunk),
            DigestState::Sha512(hasher) => hasher.update(chunk),
            DigestState::Md5(hasher) => hasher.update(chunk),
        }
        self.bytes_seen += chunk.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn finalize(self) -> Checksum {
        let hex = match self.state {
            DigestState::Sha256(hasher) => hex::encode(hasher.finalize()),
            DigestState::Sha512(hasher) => hex::encode(hasher.finalize()),
            DigestState::Md5(hasher) => hex::encode(hasher.finalize()),
        };
        Checksum {
            algorithm: self.algorithm,
            hex,
            bytes: self.bytes_seen,
        }
    }
}

/// One-shot digest of a complete buffer.
pub fn digest(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    let mut stream = ChecksumStream::new(algorithm);
    stream.update(data);
    stream.finalize().hex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn streamed_digest_matches_buffered_for_any_chunking() {
        let data = sample(70_000);
        for algorithm in [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Sha512, ChecksumAlgorithm::Md5] {
            let expected = match algorithm {
                ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(&data)),
                ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(&data)),
                ChecksumAlgorithm::Md5 => hex::encode(Md5::digest(&data)),
            };
            for chunk_size in [1, 7, 512, 4096, 65_536, 100_000] {
                let mut stream = ChecksumStream::new(algorithm);
                for chunk in data.chunks(chunk_size) {
                    stream.update(chunk);
                }
                let checksum = stream.finalize();
                assert_eq!(checksum.hex, expected, "{:?} chunk={}", algorithm, chunk_size);
                assert_eq!(checksum.bytes, data.len() as u64);
            }
        }
    }

    #[test]
    fn empty_input_has_known_digest() {
        assert_eq!(
            digest(ChecksumAlgorithm::Sha256, b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest(ChecksumAlgorithm::Md5, b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
