//! Transaction model: tagged input/output variants, prefix hashing, and the
//! amount arithmetic used by fee and overflow checks.

use umbrad_crypto::{fast_hash, Hash, KeyImage, PublicKey, Signature};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

const INPUT_TAG_BASE: u8 = 0xff;
const INPUT_TAG_KEY: u8 = 0x02;
const INPUT_TAG_MULTISIGNATURE: u8 = 0x03;
const OUTPUT_TAG_KEY: u8 = 0x02;
const OUTPUT_TAG_MULTISIGNATURE: u8 = 0x03;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BaseInput {
    pub block_index: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyInput {
    pub amount: u64,
    /// Ring member offsets relative to the previous one; the first is
    /// absolute. Summing yields absolute indexes into `o/<amount>`.
    pub output_indexes: Vec<u32>,
    pub key_image: KeyImage,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MultisignatureInput {
    pub amount: u64,
    pub signature_count: u8,
    pub output_index: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransactionInput {
    Base(BaseInput),
    Key(KeyInput),
    Multisignature(MultisignatureInput),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KeyOutput {
    pub key: PublicKey,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultisignatureOutput {
    pub keys: Vec<PublicKey>,
    pub required_signature_count: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputTarget {
    Key(KeyOutput),
    Multisignature(MultisignatureOutput),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionOutput {
    pub amount: u64,
    pub target: OutputTarget,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionPrefix {
    pub version: u8,
    pub unlock_time: u64,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub extra: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub prefix: TransactionPrefix,
    /// One signature vector per input, sized to that input's ring. Empty for
    /// the coinbase.
    pub signatures: Vec<Vec<Signature>>,
}

impl TransactionInput {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        match self {
            TransactionInput::Base(input) => {
                encoder.write_u8(INPUT_TAG_BASE);
                encoder.write_varint(input.block_index as u64);
            }
            TransactionInput::Key(input) => {
                encoder.write_u8(INPUT_TAG_KEY);
                encoder.write_u64_le(input.amount);
                encoder.write_varint(input.output_indexes.len() as u64);
                for offset in &input.output_indexes {
                    encoder.write_varint(*offset as u64);
                }
                encoder.write_key_image(&input.key_image);
            }
            TransactionInput::Multisignature(input) => {
                encoder.write_u8(INPUT_TAG_MULTISIGNATURE);
                encoder.write_u64_le(input.amount);
                encoder.write_u8(input.signature_count);
                encoder.write_varint(input.output_index as u64);
            }
        }
    }

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        match decoder.read_u8()? {
            INPUT_TAG_BASE => {
                let block_index = decoder.read_varint()?;
                let block_index = u32::try_from(block_index)
                    .map_err(|_| DecodeError::InvalidData("base input height out of range"))?;
                Ok(TransactionInput::Base(BaseInput { block_index }))
            }
            INPUT_TAG_KEY => {
                let amount = decoder.read_u64_le()?;
                let count = decoder.read_varint()? as usize;
                let mut output_indexes = Vec::with_capacity(count);
                for _ in 0..count {
                    let offset = decoder.read_varint()?;
                    let offset = u32::try_from(offset)
                        .map_err(|_| DecodeError::InvalidData("ring offset out of range"))?;
                    output_indexes.push(offset);
                }
                let key_image = decoder.read_key_image()?;
                Ok(TransactionInput::Key(KeyInput {
                    amount,
                    output_indexes,
                    key_image,
                }))
            }
            INPUT_TAG_MULTISIGNATURE => {
                let amount = decoder.read_u64_le()?;
                let signature_count = decoder.read_u8()?;
                let output_index = decoder.read_varint()?;
                let output_index = u32::try_from(output_index)
                    .map_err(|_| DecodeError::InvalidData("multisig output index out of range"))?;
                Ok(TransactionInput::Multisignature(MultisignatureInput {
                    amount,
                    signature_count,
                    output_index,
                }))
            }
            _ => Err(DecodeError::InvalidData("unknown transaction input tag")),
        }
    }

    /// Number of signatures this input requires inside the signature vector.
    pub fn signature_count(&self) -> usize {
        match self {
            TransactionInput::Base(_) => 0,
            TransactionInput::Key(input) => input.output_indexes.len(),
            TransactionInput::Multisignature(input) => input.signature_count as usize,
        }
    }
}

impl OutputTarget {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        match self {
            OutputTarget::Key(target) => {
                encoder.write_u8(OUTPUT_TAG_KEY);
                encoder.write_public_key(&target.key);
            }
            OutputTarget::Multisignature(target) => {
                encoder.write_u8(OUTPUT_TAG_MULTISIGNATURE);
                encoder.write_varint(target.keys.len() as u64);
                for key in &target.keys {
                    encoder.write_public_key(key);
                }
                encoder.write_u8(target.required_signature_count);
            }
        }
    }

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        match decoder.read_u8()? {
            OUTPUT_TAG_KEY => Ok(OutputTarget::Key(KeyOutput {
                key: decoder.read_public_key()?,
            })),
            OUTPUT_TAG_MULTISIGNATURE => {
                let count = decoder.read_varint()? as usize;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(decoder.read_public_key()?);
                }
                let required_signature_count = decoder.read_u8()?;
                if required_signature_count as usize > count {
                    return Err(DecodeError::InvalidData(
                        "multisig output requires more signatures than keys",
                    ));
                }
                Ok(OutputTarget::Multisignature(MultisignatureOutput {
                    keys,
                    required_signature_count,
                }))
            }
            _ => Err(DecodeError::InvalidData("unknown output target tag")),
        }
    }
}

impl Encodable for TransactionPrefix {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.version);
        encoder.write_u64_le(self.unlock_time);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_u64_le(output.amount);
            output.target.consensus_encode(encoder);
        }
        encoder.write_var_bytes(&self.extra);
    }
}

impl Decodable for TransactionPrefix {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u8()?;
        let unlock_time = decoder.read_u64_le()?;
        let input_count = decoder.read_varint()? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TransactionInput::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let amount = decoder.read_u64_le()?;
            let target = OutputTarget::consensus_decode(decoder)?;
            outputs.push(TransactionOutput { amount, target });
        }
        let extra = decoder.read_var_bytes()?;
        Ok(Self {
            version,
            unlock_time,
            inputs,
            outputs,
            extra,
        })
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prefix.consensus_encode(encoder);
        for per_input in &self.signatures {
            for signature in per_input {
                encoder.write_signature(signature);
            }
        }
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prefix = TransactionPrefix::consensus_decode(decoder)?;
        let mut signatures = Vec::with_capacity(prefix.inputs.len());
        let coinbase = matches!(prefix.inputs.as_slice(), [TransactionInput::Base(_)]);
        if !coinbase {
            for input in &prefix.inputs {
                let count = input.signature_count();
                let mut per_input = Vec::with_capacity(count);
                for _ in 0..count {
                    per_input.push(decoder.read_signature()?);
                }
                signatures.push(per_input);
            }
        }
        Ok(Self { prefix, signatures })
    }
}

impl Transaction {
    pub fn prefix_hash(&self) -> Hash {
        fast_hash(&crate::encoding::encode(&self.prefix))
    }

    pub fn hash(&self) -> Hash {
        fast_hash(&crate::encoding::encode(self))
    }

    pub fn binary_size(&self) -> usize {
        crate::encoding::encode(self).len()
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.prefix.inputs.as_slice(), [TransactionInput::Base(_)])
    }

    pub fn input_amount(&self) -> u64 {
        self.prefix
            .inputs
            .iter()
            .map(|input| match input {
                TransactionInput::Base(_) => 0,
                TransactionInput::Key(input) => input.amount,
                TransactionInput::Multisignature(input) => input.amount,
            })
            .sum()
    }

    pub fn output_amount(&self) -> u64 {
        self.prefix.outputs.iter().map(|output| output.amount).sum()
    }

    pub fn fee(&self) -> u64 {
        self.input_amount().saturating_sub(self.output_amount())
    }

    /// True when the output amounts sum without wrapping.
    pub fn check_outs_overflow(&self) -> bool {
        let mut total: u64 = 0;
        for output in &self.prefix.outputs {
            match total.checked_add(output.amount) {
                Some(sum) => total = sum,
                None => return false,
            }
        }
        true
    }
}

pub fn relative_output_offsets_to_absolute(offsets: &[u32]) -> Option<Vec<u32>> {
    if offsets.is_empty() {
        return None;
    }
    let mut absolute = Vec::with_capacity(offsets.len());
    let mut current: u32 = 0;
    for (index, offset) in offsets.iter().enumerate() {
        current = if index == 0 {
            *offset
        } else {
            current.checked_add(*offset)?
        };
        absolute.push(current);
    }
    Some(absolute)
}

pub fn absolute_output_offsets_to_relative(offsets: &[u32]) -> Vec<u32> {
    let mut relative = Vec::with_capacity(offsets.len());
    let mut previous = 0u32;
    for (index, offset) in offsets.iter().enumerate() {
        if index == 0 {
            relative.push(*offset);
        } else {
            relative.push(offset - previous);
        }
        previous = *offset;
    }
    relative
}
