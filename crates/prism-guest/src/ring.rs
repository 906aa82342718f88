//! Single-producer / single-consumer ring channel over the shared region.
//!
//! One side of the channel lives in this process; the other side is the
//! device, an independent consumer (or producer, for the release ring) with
//! no shared scheduler. The only cross-side state is the ring header's two
//! cursors and the entry bodies: the producer writes bodies and the producer
//! cursor, the consumer writes only the consumer cursor. `try_push` stages
//! entries locally and nothing becomes visible to the other side until
//! `publish` stores the producer cursor, so a partially built batch can be
//! abandoned without corrupting the ring.

use std::marker::PhantomData;

use prism_protocol::ring::{
    CommandDesc, CursorDesc, RingDecodeError, RingHeader, RELEASE_ENTRY_SIZE_BYTES,
    RING_CONSUMER_OFFSET, RING_PRODUCER_OFFSET,
};
use thiserror::Error;
use tracing::trace;

use crate::shmem::SharedMemory;

/// Fixed-size entry that can live in a ring slot.
pub trait RingEntry: Sized {
    const SIZE_BYTES: usize;

    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

impl RingEntry for CommandDesc {
    const SIZE_BYTES: usize = CommandDesc::SIZE_BYTES;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..Self::SIZE_BYTES].copy_from_slice(&self.encode_to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        CommandDesc::decode_from_le_bytes(buf).expect("buffer matches CommandDesc::SIZE_BYTES")
    }
}

impl RingEntry for CursorDesc {
    const SIZE_BYTES: usize = CursorDesc::SIZE_BYTES;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..Self::SIZE_BYTES].copy_from_slice(&self.encode_to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        CursorDesc::decode_from_le_bytes(buf).expect("buffer matches CursorDesc::SIZE_BYTES")
    }
}

/// Release-ring entries are bare release ids.
impl RingEntry for u64 {
    const SIZE_BYTES: usize = RELEASE_ENTRY_SIZE_BYTES;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().expect("buffer holds a release id"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring header rejected: {0:?}")]
    Header(RingDecodeError),
    #[error("cursor invariant violated: producer {producer} consumer {consumer} capacity {capacity}")]
    CursorCorruption {
        producer: u32,
        consumer: u32,
        capacity: u32,
    },
}

impl From<RingDecodeError> for RingError {
    fn from(value: RingDecodeError) -> Self {
        Self::Header(value)
    }
}

#[derive(Debug)]
pub struct RingChannel<T: RingEntry> {
    base: u64,
    capacity: u32,
    entry_stride: u32,
    /// Producer cursor including staged-but-unpublished pushes.
    local_producer: u32,
    /// Last producer value stored to the header.
    published_producer: u32,
    /// Consumer-side cursor mirror.
    local_consumer: u32,
    _entry: PhantomData<T>,
}

impl<T: RingEntry> RingChannel<T> {
    /// Attach to a ring whose header the device has already initialized at
    /// `base` within the shared region.
    pub fn attach(mem: &mut dyn SharedMemory, base: u64) -> Result<Self, RingError> {
        let mut buf = [0u8; RingHeader::SIZE_BYTES];
        mem.read_at(base, &mut buf);
        let header = RingHeader::decode_from_le_bytes(&buf)?;
        header.validate(T::SIZE_BYTES as u32)?;

        let in_flight = header.producer.wrapping_sub(header.consumer);
        if in_flight > header.capacity {
            return Err(RingError::CursorCorruption {
                producer: header.producer,
                consumer: header.consumer,
                capacity: header.capacity,
            });
        }

        Ok(Self {
            base,
            capacity: header.capacity,
            entry_stride: header.entry_stride_bytes,
            local_producer: header.producer,
            published_producer: header.producer,
            local_consumer: header.consumer,
            _entry: PhantomData,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Entries staged by `try_push` but not yet visible to the consumer.
    pub fn unpublished(&self) -> u32 {
        self.local_producer.wrapping_sub(self.published_producer)
    }

    fn entry_offset(&self, cursor: u32) -> u64 {
        let slot = cursor & (self.capacity - 1);
        self.base + RingHeader::SIZE_BYTES as u64 + u64::from(slot) * u64::from(self.entry_stride)
    }

    /// Producer side: free slots from the consumer's point of view, counting
    /// staged pushes as used.
    pub fn free_space(&self, mem: &mut dyn SharedMemory) -> Result<u32, RingError> {
        let consumer = mem.read_u32(self.base + RING_CONSUMER_OFFSET);
        let in_flight = self.local_producer.wrapping_sub(consumer);
        if in_flight > self.capacity {
            return Err(RingError::CursorCorruption {
                producer: self.local_producer,
                consumer,
                capacity: self.capacity,
            });
        }
        Ok(self.capacity - in_flight)
    }

    /// Stage one entry. Returns `Ok(false)` without blocking when the ring is
    /// full; the caller decides whether to wait for a device notification or
    /// surface the backpressure.
    pub fn try_push(&mut self, mem: &mut dyn SharedMemory, entry: &T) -> Result<bool, RingError> {
        if self.free_space(mem)? == 0 {
            trace!(capacity = self.capacity, "ring full");
            return Ok(false);
        }
        let mut buf = vec![0u8; T::SIZE_BYTES];
        entry.write_to(&mut buf);
        mem.write_at(self.entry_offset(self.local_producer), &buf);
        self.local_producer = self.local_producer.wrapping_add(1);
        Ok(true)
    }

    /// Make every staged entry visible to the consumer. Entry bodies were
    /// written by `try_push` before this cursor store, which is what the
    /// other side orders its reads against.
    pub fn publish(&mut self, mem: &mut dyn SharedMemory) {
        if self.local_producer == self.published_producer {
            return;
        }
        mem.write_u32(self.base + RING_PRODUCER_OFFSET, self.local_producer);
        self.published_producer = self.local_producer;
    }

    /// Consumer side: read everything between the last observed consumer
    /// cursor and the published producer cursor, apply `consume` to each
    /// entry, then advance and publish the consumer cursor.
    pub fn drain(
        &mut self,
        mem: &mut dyn SharedMemory,
        mut consume: impl FnMut(T),
    ) -> Result<usize, RingError> {
        let producer = mem.read_u32(self.base + RING_PRODUCER_OFFSET);
        let available = producer.wrapping_sub(self.local_consumer);
        if available > self.capacity {
            return Err(RingError::CursorCorruption {
                producer,
                consumer: self.local_consumer,
                capacity: self.capacity,
            });
        }
        let mut buf = vec![0u8; T::SIZE_BYTES];
        for _ in 0..available {
            mem.read_at(self.entry_offset(self.local_consumer), &mut buf);
            consume(T::read_from(&buf));
            self.local_consumer = self.local_consumer.wrapping_add(1);
        }
        if available > 0 {
            mem.write_u32(self.base + RING_CONSUMER_OFFSET, self.local_consumer);
        }
        Ok(available as usize)
    }

    /// Write a fresh header at `base`. The device owns ring initialization in
    /// a real attach; this exists for harnesses and device models.
    pub fn init(
        mem: &mut dyn SharedMemory,
        base: u64,
        capacity: u32,
    ) -> Result<(), RingDecodeError> {
        let header = RingHeader {
            magic: prism_protocol::ring::PRISM_RING_MAGIC,
            abi_version: prism_protocol::abi::PRISM_ABI_VERSION_U32,
            capacity,
            entry_stride_bytes: T::SIZE_BYTES as u32,
            producer: 0,
            consumer: 0,
            reserved0: 0,
            reserved1: 0,
        };
        header.validate(T::SIZE_BYTES as u32)?;
        mem.write_at(base, &header.encode_to_le_bytes());
        Ok(())
    }
}
