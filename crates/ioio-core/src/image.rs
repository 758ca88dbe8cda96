//! Firmware images
//!
//! An `.ioio` image is a flat sequence of fixed-size records. Each record is
//! a 4-byte little-endian program-memory address followed by one block of
//! payload (64 PIC24 instruction words, 3 bytes each).

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Payload bytes per block
pub const BLOCK_DATA_SIZE: usize = 192;

/// Bytes per record in the file (address + payload)
pub const RECORD_SIZE: usize = 4 + BLOCK_DATA_SIZE;

/// One unit of programming and verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    /// Program-memory start address
    pub address: u32,
    /// Payload bytes
    pub data: &'a [u8],
}

/// Ordered, restartable sequence of firmware blocks
pub trait ImageSource: Send {
    /// Move the cursor back before the first block
    fn rewind(&mut self);

    /// Advance to the next block; returns whether one is available
    fn next(&mut self) -> Result<bool>;

    /// The block under the cursor
    ///
    /// Only meaningful after `next()` returned `true`.
    fn current_block(&self) -> Block<'_>;

    /// Count the blocks, leaving the cursor rewound
    fn count_blocks(&mut self) -> Result<usize> {
        self.rewind();
        let mut count = 0;
        while self.next()? {
            count += 1;
        }
        self.rewind();
        Ok(count)
    }
}

/// In-memory `.ioio` image
#[derive(Debug, Clone)]
pub struct IoioFile {
    data: Vec<u8>,
    /// Offset of the current record, `None` before the first `next()`
    cursor: Option<usize>,
}

impl IoioFile {
    /// Parse an image from raw bytes
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() % RECORD_SIZE != 0 {
            return Err(Error::Format(format!(
                "image length {} is not a multiple of {}",
                data.len(),
                RECORD_SIZE
            )));
        }
        Ok(Self { data, cursor: None })
    }

    /// Read and parse an image file
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        log::debug!("Read {} bytes from {:?}", data.len(), path);
        Self::from_bytes(data)
    }

    /// Build an image from (address, payload) pairs
    ///
    /// Payloads shorter than a block are padded with 0xFF (erased flash).
    pub fn from_blocks<'a, I>(blocks: I) -> Self
    where
        I: IntoIterator<Item = (u32, &'a [u8])>,
    {
        let mut data = Vec::new();
        for (address, payload) in blocks {
            data.extend_from_slice(&address.to_le_bytes());
            let len = payload.len().min(BLOCK_DATA_SIZE);
            data.extend_from_slice(&payload[..len]);
            data.resize(data.len() + BLOCK_DATA_SIZE - len, 0xFF);
        }
        Self { data, cursor: None }
    }

    /// Number of records in the image
    pub fn len(&self) -> usize {
        self.data.len() / RECORD_SIZE
    }

    /// Whether the image has no records
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ImageSource for IoioFile {
    fn rewind(&mut self) {
        self.cursor = None;
    }

    fn next(&mut self) -> Result<bool> {
        let next = match self.cursor {
            None => 0,
            Some(offset) => offset + RECORD_SIZE,
        };
        if next + RECORD_SIZE > self.data.len() {
            // Stay past the end so repeated calls keep returning false
            self.cursor = Some(self.data.len());
            return Ok(false);
        }
        self.cursor = Some(next);
        Ok(true)
    }

    fn current_block(&self) -> Block<'_> {
        let offset = self.cursor.unwrap_or(0);
        let Some(record) = self.data.get(offset..offset + RECORD_SIZE) else {
            return Block {
                address: 0,
                data: &[],
            };
        };
        let mut address = [0u8; 4];
        address.copy_from_slice(&record[..4]);
        Block {
            address: u32::from_le_bytes(address),
            data: &record[4..],
        }
    }

    fn count_blocks(&mut self) -> Result<usize> {
        self.rewind();
        Ok(self.len())
    }
}
