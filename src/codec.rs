// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! Typed payloads travel as an [`Envelope`]: the encoded bytes plus the
//! content-type tag that selects the codec on the way back. Two families are
//! provided, a self-describing JSON codec and a compact binary codec that
//! requires the same schema on both ends.

use crate::errors::{DecodeError, EncodeError};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, marker::PhantomData};

/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for bitcode-encoded messages
pub const BINARY_CONTENT_TYPE: &str = "application/x-bitcode";

/// Wire representation of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub content_type: String,
    pub data: Vec<u8>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Creates an envelope with no message id and no headers.
    ///
    /// # Parameters
    /// * `content_type` - Tag naming the codec that produced `data`
    /// * `data` - Encoded payload
    pub fn new(content_type: &str, data: Vec<u8>) -> Self {
        Envelope {
            content_type: content_type.to_owned(),
            data,
            message_id: None,
            headers: BTreeMap::default(),
        }
    }

    pub fn with_message_id(mut self, id: String) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A serialization format identified by its content-type tag.
pub trait Codec {
    const CONTENT_TYPE: &'static str;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError>;

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError>;

    /// Encodes `value` into an envelope tagged with this codec's content type.
    fn envelope<T: Serialize>(value: &T) -> Result<Envelope, EncodeError> {
        Ok(Envelope::new(Self::CONTENT_TYPE, Self::encode(value)?))
    }
}

/// Structured-text codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(value).map_err(|err| EncodeError {
            content_type: Self::CONTENT_TYPE.to_owned(),
            reason: err.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(data).map_err(|err| DecodeError::ParsePayloadError {
            content_type: Self::CONTENT_TYPE.to_owned(),
            reason: err.to_string(),
        })
    }
}

/// Binary codec backed by `bitcode`'s serde mode.
///
/// Not self-describing: both ends must agree on the exact type.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    const CONTENT_TYPE: &'static str = BINARY_CONTENT_TYPE;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
        bitcode::serialize(value).map_err(|err| EncodeError {
            content_type: Self::CONTENT_TYPE.to_owned(),
            reason: err.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
        bitcode::deserialize(data).map_err(|err| DecodeError::ParsePayloadError {
            content_type: Self::CONTENT_TYPE.to_owned(),
            reason: err.to_string(),
        })
    }
}

/// Decodes an envelope with the codec named by its content-type tag.
pub fn decode_envelope<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, DecodeError> {
    match envelope.content_type.as_str() {
        JSON_CONTENT_TYPE => JsonCodec::decode(&envelope.data),
        BINARY_CONTENT_TYPE => BinaryCodec::decode(&envelope.data),
        other => Err(DecodeError::UnsupportedContentType(other.to_owned())),
    }
}

/// Turns a received envelope into the subscription's payload type.
///
/// Any `Fn(&[u8]) -> Result<T, DecodeError>` is a decoder that ignores the
/// tag; [`ContentTypeDecoder`] picks the codec from the tag instead.
pub trait Decoder<T>: Send + Sync {
    fn decode(&self, envelope: &Envelope) -> Result<T, DecodeError>;
}

impl<T, F> Decoder<T> for F
where
    F: Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync,
{
    fn decode(&self, envelope: &Envelope) -> Result<T, DecodeError> {
        self(&envelope.data)
    }
}

/// Decoder dispatching on the envelope's content type.
pub struct ContentTypeDecoder<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> ContentTypeDecoder<T> {
    pub fn new() -> Self {
        ContentTypeDecoder {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for ContentTypeDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder<T> for ContentTypeDecoder<T> {
    fn decode(&self, envelope: &Envelope) -> Result<T, DecodeError> {
        decode_envelope(envelope)
    }
}

pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
    JsonCodec::decode(data)
}

pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
    BinaryCodec::decode(data)
}
