use anyhow::Result;
use bytes::Bytes;

/// Converts frame payloads to application tuples and back.
pub trait StreamCodec: Send + Sync + 'static {
    type Tuple: Clone + Send + 'static;

    fn decode(&self, payload: &[u8]) -> Result<Self::Tuple>;

    fn encode(&self, tuple: &Self::Tuple) -> Bytes;

    /// Partition used to route the tuple to reservoirs.
    fn partition(&self, tuple: &Self::Tuple) -> i32;
}

/// Passes payloads through unchanged; every tuple lands in partition 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl StreamCodec for BytesCodec {
    type Tuple = Bytes;

    fn decode(&self, payload: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }

    fn encode(&self, tuple: &Bytes) -> Bytes {
        tuple.clone()
    }

    fn partition(&self, _tuple: &Bytes) -> i32 {
        0
    }
}
