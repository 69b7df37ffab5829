//! Request and response buffers
//!
//! A worker descriptor owns one `StandingBuffer`, allocated when the
//! descriptor is created and kept for its whole lifetime (including reuse).
//! Requests larger than the standing buffer get a one-shot oversized buffer
//! that is released after the response is sent.

use crate::frame::PREFIX_LEN;

/// Fixed-size request buffer allocated once per descriptor
#[derive(Debug)]
pub struct StandingBuffer {
    data: Box<[u8]>,
}

impl StandingBuffer {
    /// Allocate a standing buffer of `size` bytes (at least a prefix)
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size.max(PREFIX_LEN)].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address of the allocation; stable for the life of the buffer
    #[inline]
    pub fn addr(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

/// Per-client working set: the standing buffer, an optional oversized
/// buffer for the current request and a response buffer reused across
/// requests.
#[derive(Debug)]
pub struct RequestBuffers {
    standing: StandingBuffer,
    oversized: Option<Vec<u8>>,
    response: Vec<u8>,
}

impl RequestBuffers {
    pub fn new(standing: StandingBuffer) -> Self {
        Self {
            standing,
            oversized: None,
            response: Vec::new(),
        }
    }

    /// Destination for the packet prefix
    #[inline]
    pub fn prefix_mut(&mut self) -> &mut [u8] {
        &mut self.standing.data[..PREFIX_LEN]
    }

    /// Make room for a packet of `total` bytes.
    ///
    /// Returns `true` if an oversized buffer had to be allocated; the prefix
    /// already received is copied into it.
    pub fn prepare(&mut self, total: usize) -> bool {
        if total <= self.standing.len() {
            self.oversized = None;
            return false;
        }
        let mut big = vec![0u8; total];
        big[..PREFIX_LEN].copy_from_slice(&self.standing.data[..PREFIX_LEN]);
        self.oversized = Some(big);
        true
    }

    /// Packet buffer of `total` bytes, as sized by `prepare`
    #[inline]
    pub fn packet_mut(&mut self, total: usize) -> &mut [u8] {
        match self.oversized.as_mut() {
            Some(big) => &mut big[..total],
            None => &mut self.standing.data[..total],
        }
    }

    #[inline]
    pub fn packet(&self, total: usize) -> &[u8] {
        match self.oversized.as_ref() {
            Some(big) => &big[..total],
            None => &self.standing.data[..total],
        }
    }

    /// Split borrow: request bytes and the response buffer together
    #[inline]
    pub fn request_and_response(&mut self, total: usize) -> (&[u8], &mut Vec<u8>) {
        let req = match self.oversized.as_ref() {
            Some(big) => &big[..total],
            None => &self.standing.data[..total],
        };
        (req, &mut self.response)
    }

    #[inline]
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    #[inline]
    pub fn response_mut(&mut self) -> &mut Vec<u8> {
        &mut self.response
    }

    #[inline]
    pub fn has_oversized(&self) -> bool {
        self.oversized.is_some()
    }

    /// Drop the request-scoped oversized buffer
    #[inline]
    pub fn release_oversized(&mut self) {
        self.oversized = None;
    }

    #[inline]
    pub fn standing(&self) -> &StandingBuffer {
        &self.standing
    }

    /// Give the standing buffer back (on retirement or release to free)
    pub fn into_standing(self) -> StandingBuffer {
        self.standing
    }
}
