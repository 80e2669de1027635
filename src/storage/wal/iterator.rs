use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;

use super::record::{decode_frame, FrameDecode, Lsn, WalRecord};
use crate::storage::error::StorageResult;

struct Segment {
    path: PathBuf,
    data: Vec<u8>,
    offset: usize,
}

/// Forward scan over WAL segments, oldest first.
///
/// Segments are read one at a time as the scan reaches them. Records below
/// the starting LSN are skipped. A scan that stops early can be resumed with
/// `WalManager::iterate_from(iter.next_lsn())`.
pub struct WalIterator {
    segments: VecDeque<PathBuf>,
    current: Option<Segment>,
    from: Lsn,
    next_lsn: Lsn,
}

impl WalIterator {
    pub(super) fn new(segments: Vec<PathBuf>, from: Lsn) -> Self {
        Self {
            segments: segments.into(),
            current: None,
            from,
            next_lsn: from,
        }
    }

    /// LSN to pass to `iterate_from` to continue after the last record
    /// returned.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    fn open_next_segment(&mut self) -> Option<StorageResult<()>> {
        loop {
            let path = self.segments.pop_front()?;
            match fs::read(&path) {
                Ok(data) => {
                    self.current = Some(Segment {
                        path,
                        data,
                        offset: 0,
                    });
                    return Some(Ok(()));
                }
                // Pruned by a checkpoint after the scan started
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

impl Iterator for WalIterator {
    type Item = StorageResult<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(segment) = self.current.as_mut() else {
                if let Err(e) = self.open_next_segment()? {
                    return Some(Err(e));
                }
                continue;
            };

            match decode_frame(&segment.data[segment.offset..]) {
                FrameDecode::Record(record, used) => {
                    segment.offset += used;
                    if record.lsn() < self.from {
                        continue;
                    }
                    self.next_lsn = record.lsn().next();
                    return Some(Ok(record));
                }
                FrameDecode::Incomplete if segment.offset == segment.data.len() => {
                    self.current = None;
                }
                FrameDecode::Incomplete | FrameDecode::Corrupt => {
                    log::warn!(
                        "ignoring {} unreadable bytes at the end of {}",
                        segment.data.len() - segment.offset,
                        segment.path.display()
                    );
                    self.current = None;
                }
            }
        }
    }
}
