//! Parsing of the bencoded `.torrent` metainfo file into the crate's typed
//! torrent descriptor.

use std::path::PathBuf;

use serde_bencode::Error;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The torrent's display name, used as the download directory name for
    /// multi-file torrents.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The nominal piece length. Always fits in a `u32` in practice: no
    /// sane torrent uses pieces larger than 4 GiB.
    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// The number of pieces, derived from the length of the concatenated
    /// piece hash string.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Splits the concatenated piece hash string into individual SHA-1
    /// digests, one per piece.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// Builds the file system structure (single file or archive, with file
    /// offsets precomputed) this torrent downloads to.
    pub fn structure(&self) -> FsStructure {
        match &self.info.files {
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: self.info.length.unwrap_or(0) as u64,
                torrent_offset: 0,
            }),
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|file| {
                        let len = file.length as u64;
                        let info = FileInfo {
                            path: file.path.iter().collect(),
                            len,
                            torrent_offset,
                        };
                        torrent_offset += len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_metainfo() -> Metainfo {
        Metainfo {
            info: Info {
                name: "foo.iso".to_owned(),
                pieces: vec![0u8; 40],
                piece_length: 16 * 1024,
                length: Some(100),
                files: None,
                private: None,
            },
        }
    }

    #[test]
    fn test_single_file_structure() {
        let metainfo = single_file_metainfo();
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure().is_archive());
        assert_eq!(metainfo.structure().download_len(), 100);
    }

    #[test]
    fn test_archive_structure_computes_offsets() {
        let metainfo = Metainfo {
            info: Info {
                name: "pack".to_owned(),
                pieces: vec![0u8; 20],
                piece_length: 16 * 1024,
                length: None,
                files: Some(vec![
                    File {
                        path: vec!["a.txt".to_owned()],
                        length: 10,
                    },
                    File {
                        path: vec!["sub".to_owned(), "b.txt".to_owned()],
                        length: 20,
                    },
                ]),
                private: None,
            },
        };
        match metainfo.structure() {
            FsStructure::Archive { files } => {
                assert_eq!(files[0].torrent_offset, 0);
                assert_eq!(files[1].torrent_offset, 10);
                assert_eq!(files[1].path, PathBuf::from("sub/b.txt"));
            }
            FsStructure::File(_) => panic!("expected an archive"),
        }
    }
}
