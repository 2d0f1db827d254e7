use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

/// Most parts the OBS multipart protocol accepts for one object.
pub const MAX_PARTS: u32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Uploading,
    Committed,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Committed | UploadState::Aborted)
    }
}

/// Why a set of part slots cannot be committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartGap {
    Empty,
    Missing(u32),
    CountMismatch { counted: u32, filled: u32 },
}

struct PartSlots {
    etags: BTreeMap<u32, String>,
    state: UploadState,
}

/// An in-flight multipart upload. Share it by reference (or `Arc`) between
/// the workers adding parts; every slot takes exactly one write.
pub struct MultipartUpload {
    key: String,
    upload_id: String,
    metadata: HashMap<String, String>,
    slots: Mutex<PartSlots>,
    completed: AtomicU32,
}

impl MultipartUpload {
    pub fn new(key: &str, upload_id: &str, metadata: HashMap<String, String>) -> Self {
        Self {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            metadata,
            slots: Mutex::new(PartSlots {
                etags: BTreeMap::new(),
                state: UploadState::Initiated,
            }),
            completed: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn num_parts(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> UploadState {
        self.lock().state
    }

    pub fn part_etag(&self, part_number: u32) -> Option<String> {
        self.lock().etags.get(&part_number).cloned()
    }

    /// Part numbers run 1..=MAX_PARTS. Anything else is a caller bug.
    pub fn check_part_number(part_number: u32) {
        assert!(
            (1..=MAX_PARTS).contains(&part_number),
            "part number {} outside 1..={}",
            part_number,
            MAX_PARTS
        );
    }

    /// Store the etag of an uploaded part. Fails with the current state once
    /// the upload is committed or aborted, leaving slots and counter alone.
    ///
    /// Panics if the slot was already filled: the same part number was
    /// submitted twice.
    pub fn record_part(&self, part_number: u32, etag: &str) -> Result<(), UploadState> {
        Self::check_part_number(part_number);

        let mut slots = self.lock();
        if slots.state.is_terminal() {
            return Err(slots.state);
        }
        if let Some(existing) = slots.etags.get(&part_number) {
            panic!(
                "etag for part {} of upload {} already set: {}",
                part_number, self.upload_id, existing
            );
        }

        slots.etags.insert(part_number, etag.to_string());
        self.completed.fetch_add(1, Ordering::AcqRel);
        if slots.state == UploadState::Initiated {
            slots.state = UploadState::Uploading;
        }
        Ok(())
    }

    /// Ordered (part number, etag) list for the completion request. Slots
    /// 1..=count must all be filled and nothing beyond count may be.
    pub fn completed_parts(&self) -> Result<Vec<(u32, String)>, PartGap> {
        let slots = self.lock();
        let counted = self.completed.load(Ordering::Acquire);
        let filled = slots.etags.len() as u32;

        if counted != filled {
            return Err(PartGap::CountMismatch { counted, filled });
        }
        if counted == 0 {
            return Err(PartGap::Empty);
        }

        let mut parts = Vec::with_capacity(counted as usize);
        for part_number in 1..=counted {
            match slots.etags.get(&part_number) {
                Some(etag) => parts.push((part_number, etag.clone())),
                None => return Err(PartGap::Missing(part_number)),
            }
        }

        Ok(parts)
    }

    /// Move to a terminal state. Returns the state the upload was in.
    pub(crate) fn finish(&self, state: UploadState) -> UploadState {
        let mut slots = self.lock();
        let previous = slots.state;
        if !previous.is_terminal() {
            slots.state = state;
        }
        previous
    }

    fn lock(&self) -> MutexGuard<'_, PartSlots> {
        // A poisoned lock only follows a duplicate-part panic, which fires
        // before the map is touched.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MultipartUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUpload")
            .field("key", &self.key)
            .field("upload_id", &self.upload_id)
            .field("num_parts", &self.num_parts())
            .field("state", &self.state())
            .finish()
    }
}
