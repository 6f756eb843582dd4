#[cfg(feature = "rkyv-support")]
use std::marker::PhantomData;

#[cfg(feature = "rkyv-support")]
use bytecheck::CheckBytes;
#[cfg(feature = "rkyv-support")]
use rkyv::de::deserializers::SharedDeserializeMap;
#[cfg(feature = "rkyv-support")]
use rkyv::ser::serializers::AllocSerializer;
#[cfg(feature = "rkyv-support")]
use rkyv::validation::validators::DefaultValidator;
#[cfg(feature = "rkyv-support")]
use rkyv::{AlignedVec, Archive, Archived, Deserialize, Serialize};

use crate::CrdtData;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode entry: {0}")]
    Encode(String),
    #[error("Failed to decode entry: {0}")]
    Decode(String),
}

/// Converts entries to and from their binary representation.
///
/// The codec is the only place where the layout of keys and states
/// is known, storages and the transport only ever move opaque bytes.
pub trait CrdtCodec<K, S>: Send + Sync + 'static {
    fn encode(&self, data: &CrdtData<K, S>) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<CrdtData<K, S>, CodecError>;
}

#[cfg(feature = "rkyv-support")]
/// A [CrdtCodec] using rkyv archives with validation on decode.
pub struct RkyvCodec<K, S> {
    _entry: PhantomData<fn() -> (K, S)>,
}

#[cfg(feature = "rkyv-support")]
impl<K, S> RkyvCodec<K, S> {
    pub fn new() -> Self {
        Self {
            _entry: PhantomData,
        }
    }
}

#[cfg(feature = "rkyv-support")]
impl<K, S> Default for RkyvCodec<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "rkyv-support")]
impl<K, S> Clone for RkyvCodec<K, S> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

#[cfg(feature = "rkyv-support")]
impl<K, S> CrdtCodec<K, S> for RkyvCodec<K, S>
where
    K: 'static,
    S: 'static,
    CrdtData<K, S>: Archive + Serialize<AllocSerializer<{ crate::SCRATCH_SPACE }>>,
    Archived<CrdtData<K, S>>: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<CrdtData<K, S>, SharedDeserializeMap>,
{
    fn encode(&self, data: &CrdtData<K, S>) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<_, { crate::SCRATCH_SPACE }>(data)
            .map(|buffer| buffer.into_vec())
            .map_err(|_| CodecError::Encode("Entry could not be archived".to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CrdtData<K, S>, CodecError> {
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);

        rkyv::from_bytes::<CrdtData<K, S>>(&aligned).map_err(|_| {
            CodecError::Decode("Buffer is not a valid entry archive".to_string())
        })
    }
}
