//! Message types and their serializers.
//!
//! Every message exchanged over a channel is a Rust type implementing
//! [`Message`], which gives it a stable wire tag. A [`MessageSerializer`]
//! turns a type-erased instance into bytes and back; the protocol keeps one
//! serializer per tag.

use crate::error::WireError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

/// A type-erased, shareable message instance.
pub type AnyMessage = Arc<dyn Any + Send + Sync>;

/// A message type that can travel over a channel.
pub trait Message: Send + Sync + 'static {
    /// Stable wire tag identifying this type on both peers.
    const TAG: &'static str;
}

/// Tag plus Rust identity of a message type, used to validate registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MessageType {
    pub tag: &'static str,
    pub type_id: TypeId,
}

impl MessageType {
    pub(crate) fn of<T: Message>() -> Self {
        Self {
            tag: T::TAG,
            type_id: TypeId::of::<T>(),
        }
    }
}

/// Borrow the concrete message behind a type-erased instance.
pub(crate) fn expect_message<T: Message>(message: &AnyMessage) -> Result<&T, WireError> {
    downcast::<T>(&**message)
}

/// Converts type-erased messages to and from bytes.
pub trait MessageSerializer: Send + Sync + 'static {
    fn serialize(&self, message: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, WireError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<AnyMessage, WireError>;
}

fn downcast<T: Message>(message: &(dyn Any + Send + Sync)) -> Result<&T, WireError> {
    message
        .downcast_ref::<T>()
        .ok_or_else(|| WireError::TypeMismatch(T::TAG.to_string()))
}

/// JSON serializer backed by `serde_json`.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageSerializer for Json<T>
where
    T: Message + Serialize + DeserializeOwned,
{
    fn serialize(&self, message: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(downcast::<T>(message)?)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<AnyMessage, WireError> {
        let value: T = serde_json::from_slice(bytes)?;
        Ok(Arc::new(value))
    }
}

/// Compact binary serializer backed by `rmp-serde` (MessagePack).
pub struct MsgPack<T>(PhantomData<fn() -> T>);

impl<T> MsgPack<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for MsgPack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageSerializer for MsgPack<T>
where
    T: Message + Serialize + DeserializeOwned,
{
    fn serialize(&self, message: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, WireError> {
        Ok(rmp_serde::to_vec_named(downcast::<T>(message)?)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<AnyMessage, WireError> {
        let value: T = rmp_serde::from_slice(bytes)?;
        Ok(Arc::new(value))
    }
}
