//! The pluggable RPC payload codec (§1, §6, glossary "Codec").
//!
//! The core treats a reply frame's payload as opaque bytes — decoding them
//! into actual filesystem RPC verbs and return values is an external
//! collaborator's concern (§1, "Deliberately OUT of scope"). [`Session`]'s
//! reply callback therefore hands the caller the raw payload slice
//! directly; [`Codec`] is the extension point a layer built on top of this
//! core uses to turn that slice into something typed, without the core
//! needing to know or care what the result type is.
//!
//! [`Session`]: crate::session::Session

/// Decodes a raw reply payload into whatever representation `Frame` is.
pub trait Codec {
    type Frame;

    fn decode(&self, payload: &[u8]) -> crate::error::Result<Self::Frame>;
}

/// The trivial codec: copies the payload into an owned `Vec<u8>`. This is
/// what the crate's own tests use, and it's a reasonable starting point for
/// an embedder who wants to layer their own framing directly on raw bytes
/// rather than writing a [`Codec`] impl.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Frame = Vec<u8>;

    fn decode(&self, payload: &[u8]) -> crate::error::Result<Self::Frame> {
        Ok(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codec_is_a_passthrough() {
        let codec = RawCodec;
        let payload = [1u8, 2, 3];
        assert_eq!(codec.decode(&payload).unwrap(), payload.to_vec());
    }
}
