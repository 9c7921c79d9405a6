//! Append-only file-backed [`BlockSerializer`].
//!
//! Two files back one store: a data file holding block bodies appended at
//! their token offsets, and an index log of fixed-size records replayed at
//! open. A torn record at the log tail is discarded; everything before it
//! is authoritative.
//!
//! Layout of the index log:
//!
//! ```text
//! header:  magic u32 | version u32
//! record:  block_id u64 | flags u8 | slot u64 | len u32 | recency u64
//! ```
//!
//! `flags` bit 0 set means the record carries a token (`slot`/`len`).

use crate::{BlockBuf, BlockSerializer, BlockToken, BufWriteInfo, IndexWriteOp, IoAccount,
            cx_checkpoint};
use asupersync::Cx;
use fbc_error::{FbcError, Result};
use fbc_types::{BlockId, BlockSize, Recency, read_le_u32, read_le_u64};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, info, warn};

const INDEX_MAGIC: u32 = 0x4643_4958; // "FCIX"
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_LEN: usize = 8;
const INDEX_RECORD_LEN: usize = 8 + 1 + 8 + 4 + 8;

const FLAG_HAS_TOKEN: u8 = 0x01;

#[derive(Debug, Clone, Copy)]
struct FileIndexEntry {
    token: Option<BlockToken>,
    recency: Recency,
}

#[derive(Debug)]
struct FileState {
    index: HashMap<BlockId, FileIndexEntry>,
    next_data_offset: u64,
}

/// File-backed [`BlockSerializer`] with an append-only data file and a
/// replayed index log.
#[derive(Debug)]
pub struct FileSerializer {
    block_size: BlockSize,
    data: File,
    index_log: File,
    state: Mutex<FileState>,
}

impl FileSerializer {
    /// Open (or create) a store rooted at `path`.
    ///
    /// `path` names the data file; the index log lives beside it with an
    /// `.idx` suffix.
    pub fn open(path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let path = path.as_ref();
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let next_data_offset = data.metadata()?.len();

        let mut index_path = path.as_os_str().to_owned();
        index_path.push(".idx");
        let mut index_log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&index_path)?;

        let index = Self::replay_index(&mut index_log)?;
        info!(
            target: "fbc::ser::file",
            event = "store_opened",
            path = %path.display(),
            live_blocks = index.len(),
            data_bytes = next_data_offset
        );

        Ok(Self {
            block_size,
            data,
            index_log,
            state: Mutex::new(FileState {
                index,
                next_data_offset,
            }),
        })
    }

    fn replay_index(log: &mut File) -> Result<HashMap<BlockId, FileIndexEntry>> {
        let mut bytes = Vec::new();
        log.read_to_end(&mut bytes)?;

        let mut index = HashMap::new();
        if bytes.is_empty() {
            // Fresh store: stamp the header.
            let mut header = [0_u8; INDEX_HEADER_LEN];
            header[0..4].copy_from_slice(&INDEX_MAGIC.to_le_bytes());
            header[4..8].copy_from_slice(&INDEX_VERSION.to_le_bytes());
            log.write_all_at(&header, 0)?;
            return Ok(index);
        }

        let magic = read_le_u32(&bytes, 0)
            .map_err(|e| FbcError::Format(format!("index log header: {e}")))?;
        if magic != INDEX_MAGIC {
            return Err(FbcError::Format(format!(
                "bad index log magic: expected {INDEX_MAGIC:#x}, got {magic:#x}"
            )));
        }
        let version = read_le_u32(&bytes, 4)
            .map_err(|e| FbcError::Format(format!("index log header: {e}")))?;
        if version != INDEX_VERSION {
            return Err(FbcError::Format(format!(
                "unsupported index log version {version}"
            )));
        }

        let mut offset = INDEX_HEADER_LEN;
        let mut discarded_tail = false;
        while offset < bytes.len() {
            if offset + INDEX_RECORD_LEN > bytes.len() {
                discarded_tail = true;
                break;
            }
            let block_id = BlockId(read_le_u64(&bytes, offset).expect("bounds checked"));
            let flags = bytes[offset + 8];
            let slot = read_le_u64(&bytes, offset + 9).expect("bounds checked");
            let len = read_le_u32(&bytes, offset + 17).expect("bounds checked");
            let recency = Recency(read_le_u64(&bytes, offset + 21).expect("bounds checked"));
            offset += INDEX_RECORD_LEN;

            let token = (flags & FLAG_HAS_TOKEN != 0).then(|| BlockToken::new(slot, len));
            if token.is_none() && !recency.is_valid() {
                index.remove(&block_id);
            } else {
                match index.get_mut(&block_id) {
                    Some(entry) => {
                        if token.is_some() {
                            entry.token = token;
                        }
                        entry.recency = recency;
                    }
                    None => {
                        index.insert(block_id, FileIndexEntry { token, recency });
                    }
                }
            }
        }
        if discarded_tail {
            warn!(
                target: "fbc::ser::file",
                event = "index_tail_discarded",
                valid_bytes = offset,
                total_bytes = bytes.len()
            );
        }
        Ok(index)
    }

    fn encode_record(op: &IndexWriteOp) -> [u8; INDEX_RECORD_LEN] {
        let mut rec = [0_u8; INDEX_RECORD_LEN];
        rec[0..8].copy_from_slice(&op.block_id.0.to_le_bytes());
        if let Some(token) = op.token {
            rec[8] = FLAG_HAS_TOKEN;
            rec[9..17].copy_from_slice(&token.slot().to_le_bytes());
            rec[17..21].copy_from_slice(&token.len().to_le_bytes());
        }
        rec[21..29].copy_from_slice(&op.recency.0.to_le_bytes());
        rec
    }
}

impl BlockSerializer for FileSerializer {
    fn max_block_size(&self) -> BlockSize {
        self.block_size
    }

    fn all_recencies(&self, cx: &Cx) -> Result<HashMap<BlockId, Recency>> {
        cx_checkpoint(cx)?;
        let state = self.state.lock();
        Ok(state
            .index
            .iter()
            .filter(|(id, _)| !id.is_aux())
            .map(|(id, entry)| (*id, entry.recency))
            .collect())
    }

    fn make_io_account(&self, io_priority: i32, outstanding_limit: i32) -> IoAccount {
        IoAccount::new(io_priority, outstanding_limit)
    }

    fn block_writes(
        &self,
        cx: &Cx,
        infos: &[BufWriteInfo],
        _account: &IoAccount,
    ) -> Result<Vec<BlockToken>> {
        cx_checkpoint(cx)?;
        let mut tokens = Vec::with_capacity(infos.len());
        let mut state = self.state.lock();
        for info in infos {
            if info.buf.len() > self.block_size.as_usize() {
                return Err(FbcError::Format(format!(
                    "block body of {} bytes exceeds max block size {}",
                    info.buf.len(),
                    self.block_size
                )));
            }
            let offset = state.next_data_offset;
            self.data.write_all_at(info.buf.as_slice(), offset)?;
            state.next_data_offset = offset
                .checked_add(u64::from(self.block_size.get()))
                .ok_or_else(|| FbcError::Format("data file offset overflow".to_owned()))?;
            tokens.push(BlockToken::new(
                offset,
                u32::try_from(info.buf.len())
                    .map_err(|_| FbcError::Format("block body length overflows u32".to_owned()))?,
            ));
        }
        drop(state);
        self.data.sync_data()?;
        cx_checkpoint(cx)?;
        debug!(
            target: "fbc::ser::file",
            event = "block_writes",
            blocks = infos.len()
        );
        Ok(tokens)
    }

    fn read_block(&self, cx: &Cx, token: BlockToken, _account: &IoAccount) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        let mut buf = BlockBuf::zeroed(token.len() as usize);
        self.data.read_exact_at(buf.make_mut(), token.slot())?;
        cx_checkpoint(cx)?;
        Ok(buf)
    }

    fn index_write(&self, cx: &Cx, ops: &[IndexWriteOp]) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut state = self.state.lock();

        let mut encoded = Vec::with_capacity(ops.len() * INDEX_RECORD_LEN);
        for op in ops {
            encoded.extend_from_slice(&Self::encode_record(op));
        }
        let log_end = self.index_log.metadata()?.len();
        self.index_log.write_all_at(&encoded, log_end)?;
        self.index_log.sync_data()?;

        for op in ops {
            if op.is_deletion() {
                state.index.remove(&op.block_id);
            } else {
                match state.index.get_mut(&op.block_id) {
                    Some(entry) => {
                        if op.token.is_some() {
                            entry.token = op.token;
                        }
                        entry.recency = op.recency;
                    }
                    None => {
                        state.index.insert(
                            op.block_id,
                            FileIndexEntry {
                                token: op.token,
                                recency: op.recency,
                            },
                        );
                    }
                }
            }
        }
        debug!(
            target: "fbc::ser::file",
            event = "index_write",
            ops = ops.len()
        );
        Ok(())
    }

    fn read_ahead(
        &self,
        cx: &Cx,
        offer: &mut dyn FnMut(BlockId, BlockBuf, BlockToken),
    ) -> Result<()> {
        let live: Vec<(BlockId, BlockToken)> = {
            let state = self.state.lock();
            state
                .index
                .iter()
                .filter_map(|(id, entry)| entry.token.map(|t| (*id, t)))
                .collect()
        };
        let account = self.make_io_account(100, 16);
        for (id, token) in live {
            cx_checkpoint(cx)?;
            let buf = self.read_block(cx, token, &account)?;
            offer(id, buf, token);
        }
        Ok(())
    }
}
