//! Deposit calldata codec
//!
//! Calldata is a sequence of `(32-byte big-endian length, value)` fields
//! following a fixed 32-byte leading word. Fungible and non-fungible deposits
//! may carry a trailing `(1-byte length, priority)` pair; its presence is
//! implied by bytes remaining after the last mandatory field.
//!
//! | transfer     | layout                                                              |
//! |--------------|---------------------------------------------------------------------|
//! | fungible     | amount(32) ‖ len(32) ‖ recipient ‖ [plen(1) ‖ priority]              |
//! | non-fungible | token id(32) ‖ len(32) ‖ recipient ‖ len(32) ‖ metadata ‖ [plen ‖ p]  |
//! | generic      | len(32) ‖ metadata                                                  |

use super::{DepositNonce, DomainId, Message, Metadata, ResourceId, TransferType};
use crate::error::CodecError;

use std::sync::Arc;

const WORD: usize = 32;

/// Routing fields of a deposit that come from the event rather than calldata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub source: DomainId,
    pub destination: DomainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
}

/// Side-effecting check that runs before a deposit is parsed
pub trait DepositHook: Send + Sync {
    fn check(&self, header: &MessageHeader, calldata: &[u8]) -> Result<(), CodecError>;
}

/// Rejects deposits whose calldata exceeds a byte ceiling
pub struct CalldataSizeLimit {
    max_bytes: usize,
}

impl CalldataSizeLimit {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl DepositHook for CalldataSizeLimit {
    fn check(&self, header: &MessageHeader, calldata: &[u8]) -> Result<(), CodecError> {
        if calldata.len() > self.max_bytes {
            return Err(CodecError::Rejected(format!(
                "deposit {} from domain {} carries {} bytes of calldata, limit is {}",
                header.deposit_nonce,
                header.source,
                calldata.len(),
                self.max_bytes
            )));
        }
        Ok(())
    }
}

/// Turns deposit calldata into messages, running hooks first
#[derive(Clone, Default)]
pub struct DepositCodec {
    hooks: Vec<Arc<dyn DepositHook>>,
}

impl DepositCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: Arc<dyn DepositHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Decode deposit calldata into a message
    pub fn decode(
        &self,
        header: MessageHeader,
        transfer_type: TransferType,
        calldata: &[u8],
    ) -> Result<Message, CodecError> {
        for hook in &self.hooks {
            hook.check(&header, calldata)?;
        }

        let (payload, metadata) = match transfer_type {
            TransferType::Fungible => decode_fungible(calldata)?,
            TransferType::NonFungible => decode_non_fungible(calldata)?,
            TransferType::Generic => decode_generic(calldata)?,
        };

        Ok(Message::new(
            header.source,
            header.destination,
            header.deposit_nonce,
            header.resource_id,
            transfer_type,
            payload,
            metadata,
        ))
    }
}

/// amount ‖ len ‖ recipient ‖ [priority]
pub fn decode_fungible(calldata: &[u8]) -> Result<(Vec<Vec<u8>>, Metadata), CodecError> {
    require_len(calldata, 2 * WORD, TransferType::Fungible)?;
    let mut cursor = Cursor::new(calldata);

    let amount = cursor.take(WORD, "amount")?;
    let recipient_len = cursor.take_length("recipient length")?;
    let recipient = cursor.take(recipient_len, "recipient")?;
    let metadata = cursor.take_priority()?;

    Ok((vec![amount.to_vec(), recipient.to_vec()], metadata))
}

/// token id ‖ len ‖ recipient ‖ len ‖ metadata ‖ [priority]
pub fn decode_non_fungible(calldata: &[u8]) -> Result<(Vec<Vec<u8>>, Metadata), CodecError> {
    require_len(calldata, 2 * WORD, TransferType::NonFungible)?;
    let mut cursor = Cursor::new(calldata);

    let token_id = cursor.take(WORD, "token id")?;
    let recipient_len = cursor.take_length("recipient length")?;
    let recipient = cursor.take(recipient_len, "recipient")?;
    let metadata_len = cursor.take_length("metadata length")?;
    let token_metadata = cursor.take(metadata_len, "metadata")?;
    let metadata = cursor.take_priority()?;

    Ok((
        vec![token_id.to_vec(), recipient.to_vec(), token_metadata.to_vec()],
        metadata,
    ))
}

/// len ‖ metadata
pub fn decode_generic(calldata: &[u8]) -> Result<(Vec<Vec<u8>>, Metadata), CodecError> {
    require_len(calldata, WORD, TransferType::Generic)?;
    let mut cursor = Cursor::new(calldata);

    let metadata_len = cursor.take_length("metadata length")?;
    let metadata = cursor.take(metadata_len, "metadata")?;

    Ok((vec![metadata.to_vec()], Metadata::default()))
}

/// Encode a message back into deposit calldata, including the priority
/// extension when the message carries one.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut data = encode_payload(message.transfer_type, &message.payload)?;
    if message.transfer_type != TransferType::Generic {
        if let Some(priority) = message.priority() {
            data.push(1);
            data.push(priority);
        }
    }
    Ok(data)
}

/// Encode the payload fields only. This is the data handed to the
/// destination handler in a proposal.
pub fn encode_payload(
    transfer_type: TransferType,
    payload: &[Vec<u8>],
) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::new();
    match transfer_type {
        TransferType::Fungible => {
            let amount = field(payload, 0, "amount")?;
            let recipient = field(payload, 1, "recipient")?;
            data.extend_from_slice(as_word(amount, "amount")?);
            data.extend_from_slice(&length_word(recipient.len()));
            data.extend_from_slice(recipient);
        }
        TransferType::NonFungible => {
            let token_id = field(payload, 0, "token id")?;
            let recipient = field(payload, 1, "recipient")?;
            let metadata = field(payload, 2, "metadata")?;
            data.extend_from_slice(as_word(token_id, "token id")?);
            data.extend_from_slice(&length_word(recipient.len()));
            data.extend_from_slice(recipient);
            data.extend_from_slice(&length_word(metadata.len()));
            data.extend_from_slice(metadata);
        }
        TransferType::Generic => {
            let metadata = field(payload, 0, "metadata")?;
            data.extend_from_slice(&length_word(metadata.len()));
            data.extend_from_slice(metadata);
        }
    }
    Ok(data)
}

fn require_len(calldata: &[u8], min: usize, transfer_type: TransferType) -> Result<(), CodecError> {
    if calldata.len() < min {
        return Err(CodecError::TooShort {
            transfer_type: transfer_type.name(),
            expected: min,
            actual: calldata.len(),
        });
    }
    Ok(())
}

fn field<'a>(
    payload: &'a [Vec<u8>],
    index: usize,
    name: &'static str,
) -> Result<&'a [u8], CodecError> {
    payload
        .get(index)
        .map(Vec::as_slice)
        .ok_or(CodecError::MissingField(name))
}

/// Amounts and token ids travel as the full 32-byte word they were decoded from
fn as_word<'a>(value: &'a [u8], field: &'static str) -> Result<&'a [u8], CodecError> {
    if value.len() != WORD {
        return Err(CodecError::NotAWord {
            field,
            len: value.len(),
        });
    }
    Ok(value)
}

fn length_word(len: usize) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&(len as u64).to_be_bytes());
    word
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(CodecError::OutOfBounds {
                field,
                start: self.pos,
                end: self.pos.saturating_add(n),
                len: self.data.len(),
            }),
        }
    }

    /// Read a 32-byte big-endian length prefix
    fn take_length(&mut self, field: &'static str) -> Result<usize, CodecError> {
        let start = self.pos;
        let word = self.take(WORD, field)?;
        let (high, low) = word.split_at(WORD - 8);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(low);
        let value = u64::from_be_bytes(buf);
        if high.iter().any(|b| *b != 0) || value > usize::MAX as u64 {
            return Err(CodecError::OutOfBounds {
                field,
                start,
                end: usize::MAX,
                len: self.data.len(),
            });
        }
        Ok(value as usize)
    }

    fn take_priority(&mut self) -> Result<Metadata, CodecError> {
        if self.pos >= self.data.len() {
            return Ok(Metadata::default());
        }
        let len = self.take(1, "priority length")?[0] as usize;
        if len == 0 {
            return Err(CodecError::EmptyPriority);
        }
        let priority = self.take(len, "priority")?;
        Ok(Metadata::with_priority(priority[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn header() -> MessageHeader {
        MessageHeader {
            source: 1,
            destination: 2,
            deposit_nonce: 42,
            resource_id: ResourceId([7; 32]),
        }
    }

    fn word(value: u64) -> Vec<u8> {
        length_word(value as usize).to_vec()
    }

    fn fungible_calldata(amount: u64, recipient: &[u8]) -> Vec<u8> {
        let mut data = word(amount);
        data.extend(word(recipient.len() as u64));
        data.extend_from_slice(recipient);
        data
    }

    #[test]
    fn decodes_fungible_without_priority() {
        let recipient = [0x11u8; 20];
        let calldata = fungible_calldata(1_000_000, &recipient);

        let msg = DepositCodec::new()
            .decode(header(), TransferType::Fungible, &calldata)
            .unwrap();

        assert_eq!(msg.payload, vec![word(1_000_000), recipient.to_vec()]);
        assert!(msg.metadata.is_empty());
        assert_eq!(msg.deposit_nonce, 42);
        assert_eq!(msg.destination, 2);
    }

    #[test]
    fn decodes_fungible_priority() {
        let mut calldata = fungible_calldata(1_000_000, &[0x11; 20]);
        calldata.extend_from_slice(&[1, 1]);

        let msg = DepositCodec::new()
            .decode(header(), TransferType::Fungible, &calldata)
            .unwrap();

        assert_eq!(msg.metadata.data["Priority"], serde_json::json!(1));
        assert_eq!(msg.priority(), Some(1));
    }

    #[test]
    fn short_calldata_is_rejected() {
        let codec = DepositCodec::new();
        let err = codec
            .decode(header(), TransferType::Fungible, &[0u8; 63])
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::TooShort {
                transfer_type: "fungible",
                expected: 64,
                actual: 63
            }
        );
        assert!(matches!(
            codec.decode(header(), TransferType::NonFungible, &[0u8; 40]),
            Err(CodecError::TooShort { expected: 64, .. })
        ));
        assert!(matches!(
            codec.decode(header(), TransferType::Generic, &[0u8; 31]),
            Err(CodecError::TooShort { expected: 32, .. })
        ));
    }

    #[test]
    fn recipient_length_past_end_is_rejected() {
        let mut calldata = word(5);
        calldata.extend(word(100));
        calldata.extend_from_slice(&[0xaa; 20]);

        let err = decode_fungible(&calldata).unwrap_err();
        assert_eq!(
            err,
            CodecError::OutOfBounds {
                field: "recipient",
                start: 64,
                end: 164,
                len: 84
            }
        );
    }

    #[test]
    fn oversized_length_word_is_rejected() {
        let mut calldata = word(5);
        let mut huge = [0u8; 32];
        huge[0] = 1;
        calldata.extend_from_slice(&huge);

        assert!(matches!(
            decode_fungible(&calldata),
            Err(CodecError::OutOfBounds { field: "recipient length", .. })
        ));
    }

    #[test]
    fn zero_length_priority_is_rejected() {
        let mut calldata = fungible_calldata(1, &[0x11; 20]);
        calldata.push(0);
        assert_eq!(decode_fungible(&calldata), Err(CodecError::EmptyPriority));
    }

    #[test]
    fn decodes_non_fungible_with_metadata_and_priority() {
        let mut calldata = word(9);
        calldata.extend(word(20));
        calldata.extend_from_slice(&[0x22; 20]);
        calldata.extend(word(3));
        calldata.extend_from_slice(b"uri");
        calldata.extend_from_slice(&[1, 4]);

        let msg = DepositCodec::new()
            .decode(header(), TransferType::NonFungible, &calldata)
            .unwrap();

        assert_eq!(
            msg.payload,
            vec![word(9), vec![0x22; 20], b"uri".to_vec()]
        );
        assert_eq!(msg.priority(), Some(4));
        assert_eq!(encode(&msg).unwrap(), calldata);
    }

    #[test]
    fn generic_ignores_trailing_bytes() {
        let mut calldata = word(4);
        calldata.extend_from_slice(&[1, 2, 3, 4]);
        calldata.extend_from_slice(&[1, 9]);

        let (payload, metadata) = decode_generic(&calldata).unwrap();
        assert_eq!(payload, vec![vec![1, 2, 3, 4]]);
        assert!(metadata.is_empty());
    }

    #[test]
    fn fungible_round_trip_is_stable() {
        let mut calldata = fungible_calldata(77, &[0x33; 32]);
        calldata.extend_from_slice(&[1, 2]);
        let codec = DepositCodec::new();

        let first = codec
            .decode(header(), TransferType::Fungible, &calldata)
            .unwrap();
        let encoded = encode(&first).unwrap();
        let second = codec
            .decode(header(), TransferType::Fungible, &encoded)
            .unwrap();

        assert_eq!(encoded, calldata);
        assert_eq!(first, second);
    }

    #[test]
    fn proposal_payload_drops_priority() {
        let calldata = fungible_calldata(77, &[0x33; 20]);
        let mut with_priority = calldata.clone();
        with_priority.extend_from_slice(&[1, 2]);

        let msg = DepositCodec::new()
            .decode(header(), TransferType::Fungible, &with_priority)
            .unwrap();
        assert_eq!(
            encode_payload(msg.transfer_type, &msg.payload).unwrap(),
            calldata
        );
    }

    #[test]
    fn generic_round_trip_is_stable() {
        let mut calldata = word(5);
        calldata.extend_from_slice(b"hello");
        let codec = DepositCodec::new();

        let first = codec
            .decode(header(), TransferType::Generic, &calldata)
            .unwrap();
        assert_eq!(first.payload, vec![b"hello".to_vec()]);

        let encoded = encode(&first).unwrap();
        assert_eq!(encoded, calldata);
        assert_eq!(decode_generic(&encoded).unwrap(), (first.payload, Metadata::default()));
    }

    #[test]
    fn encode_rejects_short_amount_and_missing_fields() {
        let msg = Message::new(
            1,
            2,
            3,
            ResourceId::default(),
            TransferType::Fungible,
            vec![vec![0x0f, 0x42, 0x40], vec![0x44; 20]],
            Metadata::default(),
        );
        assert_eq!(
            encode(&msg),
            Err(CodecError::NotAWord {
                field: "amount",
                len: 3
            })
        );

        let missing = Message {
            payload: vec![word(1)],
            ..msg
        };
        assert_eq!(
            encode(&missing),
            Err(CodecError::MissingField("recipient"))
        );

        let token_id = Message::new(
            1,
            2,
            3,
            ResourceId::default(),
            TransferType::NonFungible,
            vec![vec![0u8; 33], vec![0x44; 20], vec![]],
            Metadata::default(),
        );
        assert!(matches!(
            encode(&token_id),
            Err(CodecError::NotAWord { field: "token id", len: 33 })
        ));
    }

    struct CountingHook(AtomicUsize);

    impl DepositHook for CountingHook {
        fn check(&self, _: &MessageHeader, _: &[u8]) -> Result<(), CodecError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn hooks_run_before_parsing_and_short_circuit() {
        let counter = Arc::new(CountingHook(AtomicUsize::new(0)));
        let codec = DepositCodec::new()
            .with_hook(counter.clone())
            .with_hook(Arc::new(CalldataSizeLimit::new(64)));

        // too short for the handler, hooks still run first
        assert!(matches!(
            codec.decode(header(), TransferType::Fungible, &[0u8; 10]),
            Err(CodecError::TooShort { .. })
        ));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let calldata = fungible_calldata(1, &[0x11; 20]);
        assert!(matches!(
            codec.decode(header(), TransferType::Fungible, &calldata),
            Err(CodecError::Rejected(_))
        ));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
