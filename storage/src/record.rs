use bytes::Bytes;

use crate::ids::RecordId;

/// An opaque tuple payload and, once stored, the slot it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    rid: Option<RecordId>,
    data: Bytes,
}

impl Record {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            rid: None,
            data: data.into(),
        }
    }

    pub(crate) fn stored(rid: RecordId, data: &[u8]) -> Self {
        Self {
            rid: Some(rid),
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn rid(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_rid(&mut self, rid: Option<RecordId>) {
        self.rid = rid;
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
