//! The write-ahead log: an append-only sibling file of redo records.
//!
//! Every record is framed as `[total_len u32][crc u32][bincode body]`, all
//! little-endian, crc32 over the body. Replay trusts a record only if its
//! frame is complete and its checksum matches; the first torn or damaged
//! frame ends the scan and everything before it remains valid.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreResult;
use crate::{store_debug_log, PageNo};

const FRAME_HEADER_BYTES: usize = 8;

// A body is one page image plus a few words of framing; anything bigger is
// garbage and ends the replay scan.
const MAX_RECORD_BYTES: u32 = (crate::PAGE_SIZE as u32) * 2;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WalRecordKind {
    /// Full after-image of a page staged by a transaction.
    PageImage { page_no: PageNo, image: Vec<u8> },
    /// The transaction is durable once this record is on disk.
    Commit,
    /// The transaction was rolled back; replay must ignore it.
    Abort,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WalRecord {
    seq: u64,
    txn_id: u64,
    kind: WalRecordKind,
}

/// Page images of one committed transaction, in the order they were logged.
pub struct CommittedTxn {
    pub txn_id: u64,
    pub pages: Vec<(PageNo, Vec<u8>)>,
}

pub struct ReplaySet {
    /// Committed transactions past the watermark, in commit order.
    pub transactions: Vec<CommittedTxn>,
    /// Highest sequence number of any intact record in the log.
    pub max_seq: u64,
}

pub struct Wal {
    file: File,
    path: PathBuf,
    next_seq: u64,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;
        Ok(Wal {
            file,
            path: path_buf,
            next_seq: 1,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seeds the sequence counter; called by the pager after recovery so
    /// sequence numbers stay monotonic across truncations.
    pub fn set_next_seq(&mut self, next_seq: u64) {
        self.next_seq = next_seq;
    }

    pub fn size(&self) -> StoreResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Sequence number of the most recently appended record.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Appends one record. Buffered; call [`Wal::sync`] to make it durable.
    pub fn append(&mut self, txn_id: u64, kind: WalRecordKind) -> StoreResult<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let record = WalRecord { seq, txn_id, kind };
        let body = bincode::serialize(&record).map_err(io::Error::other)?;

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();
        let total_len = (FRAME_HEADER_BYTES + body.len()) as u32;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&total_len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&body)?;
        Ok(seq)
    }

    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Empties the log after a checkpoint or recovery.
    pub fn reset(&mut self) -> StoreResult<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Scans the whole log and collects committed transactions whose COMMIT
    /// sequence exceeds `watermark`.
    pub fn replay(&mut self, watermark: u64) -> StoreResult<ReplaySet> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;

        let mut staged: HashMap<u64, Vec<(PageNo, Vec<u8>)>> = HashMap::new();
        let mut committed: Vec<(u64, CommittedTxn)> = Vec::new();
        let mut max_seq = watermark;

        let mut pos = 0usize;
        while pos + FRAME_HEADER_BYTES <= buf.len() {
            let total_len = u32::from_le_bytes([
                buf[pos],
                buf[pos + 1],
                buf[pos + 2],
                buf[pos + 3],
            ]);
            let crc = u32::from_le_bytes([
                buf[pos + 4],
                buf[pos + 5],
                buf[pos + 6],
                buf[pos + 7],
            ]);
            if total_len < FRAME_HEADER_BYTES as u32 || total_len > MAX_RECORD_BYTES {
                store_debug_log!("[Wal::replay] bad frame length {total_len} at {pos}, stopping");
                break;
            }
            let end = pos + total_len as usize;
            if end > buf.len() {
                store_debug_log!("[Wal::replay] torn record at {pos}, stopping");
                break;
            }
            let body = &buf[pos + FRAME_HEADER_BYTES..end];

            let mut hasher = Hasher::new();
            hasher.update(body);
            if hasher.finalize() != crc {
                store_debug_log!("[Wal::replay] checksum mismatch at {pos}, stopping");
                break;
            }

            let record: WalRecord = match bincode::deserialize(body) {
                Ok(r) => r,
                Err(_) => {
                    store_debug_log!("[Wal::replay] undecodable record at {pos}, stopping");
                    break;
                }
            };
            if record.seq > max_seq {
                max_seq = record.seq;
            }

            match record.kind {
                WalRecordKind::PageImage { page_no, image } => {
                    staged
                        .entry(record.txn_id)
                        .or_default()
                        .push((page_no, image));
                }
                WalRecordKind::Commit => {
                    let pages = staged.remove(&record.txn_id).unwrap_or_default();
                    committed.push((
                        record.seq,
                        CommittedTxn {
                            txn_id: record.txn_id,
                            pages,
                        },
                    ));
                }
                WalRecordKind::Abort => {
                    staged.remove(&record.txn_id);
                }
            }
            pos = end;
        }

        committed.sort_by_key(|(commit_seq, _)| *commit_seq);
        let transactions = committed
            .into_iter()
            .filter(|(commit_seq, _)| *commit_seq > watermark)
            .map(|(_, txn)| txn)
            .collect();

        Ok(ReplaySet {
            transactions,
            max_seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image(fill: u8) -> Vec<u8> {
        vec![fill; crate::PAGE_SIZE]
    }

    #[test]
    fn replay_returns_only_committed_transactions() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("t.wal")).unwrap();

        wal.append(1, WalRecordKind::PageImage { page_no: 2, image: image(0xAA) })
            .unwrap();
        wal.append(1, WalRecordKind::Commit).unwrap();
        wal.append(2, WalRecordKind::PageImage { page_no: 3, image: image(0xBB) })
            .unwrap();
        // txn 2 never commits.
        wal.sync().unwrap();

        let replay = wal.replay(0).unwrap();
        assert_eq!(replay.transactions.len(), 1);
        assert_eq!(replay.transactions[0].txn_id, 1);
        assert_eq!(replay.transactions[0].pages.len(), 1);
        assert_eq!(replay.transactions[0].pages[0].0, 2);
    }

    #[test]
    fn aborted_transaction_is_ignored() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("t.wal")).unwrap();

        wal.append(1, WalRecordKind::PageImage { page_no: 2, image: image(1) })
            .unwrap();
        wal.append(1, WalRecordKind::Abort).unwrap();
        wal.append(2, WalRecordKind::PageImage { page_no: 2, image: image(2) })
            .unwrap();
        wal.append(2, WalRecordKind::Commit).unwrap();

        let replay = wal.replay(0).unwrap();
        assert_eq!(replay.transactions.len(), 1);
        assert_eq!(replay.transactions[0].txn_id, 2);
    }

    #[test]
    fn watermark_filters_already_applied_commits() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("t.wal")).unwrap();

        wal.append(1, WalRecordKind::PageImage { page_no: 1, image: image(1) })
            .unwrap();
        let commit_seq = wal.append(1, WalRecordKind::Commit).unwrap();
        wal.append(2, WalRecordKind::PageImage { page_no: 2, image: image(2) })
            .unwrap();
        wal.append(2, WalRecordKind::Commit).unwrap();

        let replay = wal.replay(commit_seq).unwrap();
        assert_eq!(replay.transactions.len(), 1);
        assert_eq!(replay.transactions[0].txn_id, 2);
        assert_eq!(replay.max_seq, 4);
    }

    #[test]
    fn torn_tail_ends_the_scan_but_keeps_earlier_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append(1, WalRecordKind::PageImage { page_no: 1, image: image(1) })
            .unwrap();
        wal.append(1, WalRecordKind::Commit).unwrap();
        wal.append(2, WalRecordKind::PageImage { page_no: 2, image: image(2) })
            .unwrap();
        wal.append(2, WalRecordKind::Commit).unwrap();
        wal.sync().unwrap();

        // Chop the file mid-way through the last frame.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let mut wal = Wal::open(&path).unwrap();
        let replay = wal.replay(0).unwrap();
        assert_eq!(replay.transactions.len(), 1);
        assert_eq!(replay.transactions[0].txn_id, 1);
    }

    #[test]
    fn corrupt_checksum_ends_the_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append(1, WalRecordKind::Commit).unwrap();
        let first_end = wal.size().unwrap();
        wal.append(2, WalRecordKind::PageImage { page_no: 5, image: image(9) })
            .unwrap();
        wal.append(2, WalRecordKind::Commit).unwrap();
        wal.sync().unwrap();

        // Flip a byte in the second record's body.
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(first_end + FRAME_HEADER_BYTES as u64 + 2))
            .unwrap();
        file.write_all(&[0xFF]).unwrap();

        let mut wal = Wal::open(&path).unwrap();
        let replay = wal.replay(0).unwrap();
        // txn 1 committed before the damage; txn 2's records are lost.
        assert_eq!(replay.transactions.len(), 1);
        assert_eq!(replay.transactions[0].txn_id, 1);
    }

    #[test]
    fn reset_empties_the_log() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("t.wal")).unwrap();
        wal.append(1, WalRecordKind::Commit).unwrap();
        wal.reset().unwrap();
        assert_eq!(wal.size().unwrap(), 0);
        let replay = wal.replay(0).unwrap();
        assert!(replay.transactions.is_empty());
    }
}
