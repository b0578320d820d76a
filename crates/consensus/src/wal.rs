//! Write-Ahead Log for consensus recovery.
//!
//! Every inbound message (including the node's own votes and proposals,
//! logged before broadcast), every timeout tick and every step transition
//! is appended before it takes effect. Replaying the log therefore drives
//! the live handlers through the exact same inputs and reconstructs the
//! round state after a crash.
//!
//! ## WAL Format
//!
//! Entries use a binary frame with a CRC32 trailer for integrity:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Magic (4 bytes)   │ Version (1 byte)  │ Entry Type (1 byte)      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Payload Length (4 bytes, little-endian)                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Payload (variable length)                                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ CRC32 Checksum (4 bytes, little-endian)                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Entry Types
//!
//! - `HeightStart`: consensus began a new height
//! - `Input`: an inbound message (peer or loopback)
//! - `Timeout`: a timeout tick delivered to the core
//! - `Step`: an internal step transition
//! - `EndHeight`: the height was committed and closed

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use meridian_types::{Block, Part};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::timeout::TimeoutInfo;
use crate::types::{Height, PeerId, Proposal, Round, Step, Vote};

/// Magic bytes identifying Meridian WAL files.
const WAL_MAGIC: [u8; 4] = [0x4D, 0x52, 0x57, 0x4C]; // "MRWL"

/// Current WAL format version.
const WAL_VERSION: u8 = 1;

/// Header size in bytes (magic + version + entry_type + length).
const HEADER_SIZE: usize = 10;

/// CRC32 checksum size.
const CRC_SIZE: usize = 4;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error during WAL operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Corrupted WAL entry (checksum mismatch or invalid format)
    #[error("corrupted WAL entry at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset in the WAL file
        offset: u64,
        /// Description of the corruption
        message: String,
    },

    /// Invalid WAL magic bytes
    #[error("invalid WAL magic bytes")]
    InvalidMagic,

    /// Unsupported WAL version
    #[error("unsupported WAL version: {0} (expected {WAL_VERSION})")]
    UnsupportedVersion(u8),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// WAL file handle is gone (closed)
    #[error("WAL is closed")]
    Closed,
}

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Configuration for the consensus WAL.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the WAL file
    pub dir: PathBuf,
    /// Whether to fsync after each write
    pub sync_on_write: bool,
    /// Whether to fail on corrupted entries (false = truncate and continue)
    pub strict_recovery: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/consensus-wal"),
            sync_on_write: true,
            strict_recovery: false,
        }
    }
}

/// Entry types in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// Consensus began a new height
    HeightStart = 1,
    /// An inbound message was delivered to the core
    Input = 2,
    /// A timeout tick was delivered to the core
    Timeout = 3,
    /// The core performed a step transition
    Step = 4,
    /// The height was committed and closed
    EndHeight = 5,
}

impl TryFrom<u8> for WalEntryType {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WalEntryType::HeightStart),
            2 => Ok(WalEntryType::Input),
            3 => Ok(WalEntryType::Timeout),
            4 => Ok(WalEntryType::Step),
            5 => Ok(WalEntryType::EndHeight),
            _ => Err(WalError::Corrupted {
                offset: 0,
                message: format!("invalid entry type: {}", value),
            }),
        }
    }
}

/// Serializable mirror of the core's inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalInput {
    /// Start (or re-enter) a round
    Start {
        /// Height to start
        height: Height,
        /// Round to start
        round: Round,
    },
    /// A proposal message
    Proposal {
        /// The proposal
        proposal: Proposal,
        /// Sending peer; `None` for our own proposal
        peer: Option<PeerId>,
    },
    /// A block part message
    BlockPart {
        /// Height the part belongs to
        height: Height,
        /// Round the part belongs to
        round: Round,
        /// The part
        part: Part,
        /// Sending peer; `None` for our own parts
        peer: Option<PeerId>,
    },
    /// A vote message
    Vote {
        /// The vote
        vote: Vote,
        /// Sending peer; `None` for our own votes
        peer: Option<PeerId>,
    },
    /// A proposal delivered together with its complete block
    SetProposalAndBlock {
        /// The proposal
        proposal: Proposal,
        /// The full block
        block: Block,
        /// Sending peer
        peer: Option<PeerId>,
    },
}

/// Payload for `HeightStart` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeightStartPayload {
    /// The height being started
    pub height: Height,
    /// Wall clock at the start (Unix millis)
    pub timestamp_ms: u64,
}

/// Payload for `Step` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPayload {
    /// Height of the transition
    pub height: Height,
    /// Round of the transition
    pub round: Round,
    /// The step entered
    pub step: Step,
}

/// Payload for `EndHeight` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndHeightPayload {
    /// The height that was committed
    pub height: Height,
}

/// A WAL entry with type and raw payload.
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Type of the entry
    pub entry_type: WalEntryType,
    /// Serialized payload
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Create a `HeightStart` entry.
    pub fn height_start(height: Height, timestamp_ms: u64) -> Self {
        Self {
            entry_type: WalEntryType::HeightStart,
            payload: frame_serialize(&HeightStartPayload {
                height,
                timestamp_ms,
            }),
        }
    }

    /// Create an `Input` entry.
    pub fn input(input: &WalInput) -> Self {
        Self {
            entry_type: WalEntryType::Input,
            payload: frame_serialize(input),
        }
    }

    /// Create a `Timeout` entry.
    pub fn timeout(info: &TimeoutInfo) -> Self {
        Self {
            entry_type: WalEntryType::Timeout,
            payload: frame_serialize(info),
        }
    }

    /// Create a `Step` entry.
    pub fn step(height: Height, round: Round, step: Step) -> Self {
        Self {
            entry_type: WalEntryType::Step,
            payload: frame_serialize(&StepPayload {
                height,
                round,
                step,
            }),
        }
    }

    /// Create an `EndHeight` entry.
    pub fn end_height(height: Height) -> Self {
        Self {
            entry_type: WalEntryType::EndHeight,
            payload: frame_serialize(&EndHeightPayload { height }),
        }
    }

    /// Serialize the entry to its framed byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let mut data = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CRC_SIZE);

        data.extend_from_slice(&WAL_MAGIC);
        data.push(WAL_VERSION);
        data.push(self.entry_type as u8);
        data.extend_from_slice(&payload_len.to_le_bytes());
        data.extend_from_slice(&self.payload);

        let crc = crc32_checksum(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        data
    }

    /// Deserialize an entry from framed bytes.
    pub fn from_bytes(data: &[u8], offset: u64) -> WalResult<Self> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(WalError::Corrupted {
                offset,
                message: "entry too short".to_string(),
            });
        }
        if data[0..4] != WAL_MAGIC {
            return Err(WalError::InvalidMagic);
        }
        let version = data[4];
        if version != WAL_VERSION {
            return Err(WalError::UnsupportedVersion(version));
        }
        let entry_type = WalEntryType::try_from(data[5]).map_err(|_| WalError::Corrupted {
            offset,
            message: format!("invalid entry type: {}", data[5]),
        })?;
        let payload_len = u32::from_le_bytes(data[6..10].try_into().expect("4 bytes")) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if data.len() < total_len {
            return Err(WalError::Corrupted {
                offset,
                message: format!(
                    "incomplete entry: expected {} bytes, got {}",
                    total_len,
                    data.len()
                ),
            });
        }

        let stored_crc = u32::from_le_bytes(
            data[HEADER_SIZE + payload_len..total_len]
                .try_into()
                .expect("4 bytes"),
        );
        let computed_crc = crc32_checksum(&data[..HEADER_SIZE + payload_len]);
        if stored_crc != computed_crc {
            return Err(WalError::Corrupted {
                offset,
                message: format!(
                    "CRC mismatch: stored {:#x}, computed {:#x}",
                    stored_crc, computed_crc
                ),
            });
        }

        Ok(Self {
            entry_type,
            payload: data[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec(),
        })
    }

    /// Parse as a `HeightStart` payload.
    pub fn as_height_start(&self) -> WalResult<HeightStartPayload> {
        frame_deserialize(&self.payload)
    }

    /// Parse as an `Input` payload.
    pub fn as_input(&self) -> WalResult<WalInput> {
        frame_deserialize(&self.payload)
    }

    /// Parse as a `Timeout` payload.
    pub fn as_timeout(&self) -> WalResult<TimeoutInfo> {
        frame_deserialize(&self.payload)
    }

    /// Parse as a `Step` payload.
    pub fn as_step(&self) -> WalResult<StepPayload> {
        frame_deserialize(&self.payload)
    }

    /// Parse as an `EndHeight` payload.
    pub fn as_end_height(&self) -> WalResult<EndHeightPayload> {
        frame_deserialize(&self.payload)
    }
}

/// Entries recovered for crash replay.
#[derive(Debug, Default)]
pub struct WalReplay {
    /// The last height with a `HeightStart` entry (0 = empty WAL)
    pub last_height: Height,
    /// Wall clock recorded at that height start
    pub start_time_ms: u64,
    /// Whether that height also has an `EndHeight` (nothing to replay)
    pub ended: bool,
    /// Entries recorded after the last `HeightStart`, in order
    pub entries: Vec<WalEntry>,
    /// Corrupted entries skipped during recovery
    pub corrupted_entries: usize,
}

/// The consensus write-ahead log.
pub struct ConsensusWal {
    config: WalConfig,
    file: Mutex<Option<BufWriter<File>>>,
    offset: Mutex<u64>,
}

impl ConsensusWal {
    /// Open or create the WAL under `config.dir`.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let path = config.dir.join("consensus.wal");
        info!(path = %path.display(), "Opening consensus WAL");

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            config,
            file: Mutex::new(Some(BufWriter::new(file))),
            offset: Mutex::new(offset),
        })
    }

    fn write_entry(&self, entry: WalEntry) -> WalResult<()> {
        let data = entry.to_bytes();

        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(WalError::Closed)?;
        file.write_all(&data)?;
        if self.config.sync_on_write {
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        *self.offset.lock() += data.len() as u64;

        debug!(entry_type = ?entry.entry_type, bytes = data.len(), "WAL entry written");
        Ok(())
    }

    /// Record the start of a height.
    pub fn write_height_start(&self, height: Height, timestamp_ms: u64) -> WalResult<()> {
        self.write_entry(WalEntry::height_start(height, timestamp_ms))
    }

    /// Record an inbound message before it is handled.
    pub fn write_input(&self, input: &WalInput) -> WalResult<()> {
        self.write_entry(WalEntry::input(input))
    }

    /// Record a timeout tick before it is handled.
    pub fn write_timeout(&self, info: &TimeoutInfo) -> WalResult<()> {
        self.write_entry(WalEntry::timeout(info))
    }

    /// Record a step transition.
    pub fn write_step(&self, height: Height, round: Round, step: Step) -> WalResult<()> {
        self.write_entry(WalEntry::step(height, round, step))
    }

    /// Record the commit of a height.
    pub fn write_end_height(&self, height: Height) -> WalResult<()> {
        self.write_entry(WalEntry::end_height(height))
    }

    /// Read the tail of the log needed to resume the interrupted height.
    ///
    /// With `strict_recovery` off, a corrupted suffix is truncated away and
    /// replay proceeds from what remains; with it on, corruption is fatal.
    pub fn recover(&self) -> WalResult<WalReplay> {
        let path = self.config.dir.join("consensus.wal");
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut replay = WalReplay::default();
        if file_len == 0 {
            return Ok(replay);
        }

        info!(bytes = file_len, "Recovering consensus WAL");

        let mut data = Vec::with_capacity(file_len as usize);
        let mut reader = io::BufReader::new(file);
        reader.read_to_end(&mut data)?;

        let mut offset = 0u64;
        let mut last_valid_offset = 0u64;
        let mut entries: Vec<WalEntry> = Vec::new();

        while (offset as usize) < data.len() {
            let remaining = &data[offset as usize..];
            match WalEntry::from_bytes(remaining, offset) {
                Ok(entry) => {
                    let total = HEADER_SIZE + entry.payload.len() + CRC_SIZE;
                    match entry.entry_type {
                        WalEntryType::HeightStart => {
                            let payload = entry.as_height_start()?;
                            replay.last_height = payload.height;
                            replay.start_time_ms = payload.timestamp_ms;
                            replay.ended = false;
                            entries.clear();
                        }
                        WalEntryType::EndHeight => {
                            replay.ended = true;
                            entries.clear();
                        }
                        _ => entries.push(entry),
                    }
                    offset += total as u64;
                    last_valid_offset = offset;
                }
                Err(e) => {
                    if self.config.strict_recovery {
                        return Err(e);
                    }
                    warn!(offset, error = %e, "Corrupted WAL entry, truncating");
                    replay.corrupted_entries += 1;
                    break;
                }
            }
        }

        if replay.corrupted_entries > 0 {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(last_valid_offset)?;
            *self.offset.lock() = last_valid_offset;
        }

        replay.entries = entries;
        info!(
            last_height = replay.last_height,
            ended = replay.ended,
            entries = replay.entries.len(),
            "WAL recovery complete"
        );
        Ok(replay)
    }

    /// Flush buffered writes to disk.
    pub fn flush(&self) -> WalResult<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            file.flush()?;
            if self.config.sync_on_write {
                file.get_ref().sync_all()?;
            }
        }
        Ok(())
    }

    /// Flush and close the WAL.
    pub fn close(&self) -> WalResult<()> {
        let mut guard = self.file.lock();
        if let Some(mut file) = guard.take() {
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> u64 {
        *self.offset.lock()
    }
}

impl Drop for ConsensusWal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Error closing WAL");
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Current wall clock in milliseconds.
pub(crate) fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// CRC32 checksum (IEEE polynomial).
fn crc32_checksum(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = generate_crc32_table();
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        let index = ((crc ^ (*byte as u32)) & 0xFF) as usize;
        crc = TABLE[index] ^ (crc >> 8);
    }
    !crc
}

/// Generate the CRC32 lookup table at compile time.
const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = 0xEDB8_8320 ^ (crc >> 1);
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Length-prefixed JSON payload encoding.
fn frame_serialize<T: Serialize>(value: &T) -> Vec<u8> {
    let json = serde_json::to_vec(value).unwrap_or_default();
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&(json.len() as u32).to_le_bytes());
    result.extend_from_slice(&json);
    result
}

/// Length-prefixed JSON payload decoding.
fn frame_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> WalResult<T> {
    if data.len() < 4 {
        return Err(WalError::Serialization("payload too short".to_string()));
    }
    let len = u32::from_le_bytes(data[0..4].try_into().expect("4 bytes")) as usize;
    if data.len() < 4 + len {
        return Err(WalError::Serialization("incomplete payload".to_string()));
    }
    serde_json::from_slice(&data[4..4 + len]).map_err(|e| WalError::Serialization(e.to_string()))
}
