use crate::error::Error;

pub type SequenceNumber = u64;

// Sequences share a u64 with the 8-bit value tag, leaving 56 bits.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

// When seeking, the highest-sorting tag for a given (user key, sequence).
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl TryFrom<u8> for ValueType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0u8 => Ok(ValueType::Deletion),
            1u8 => Ok(ValueType::Value),
            _ => Err(Error::Corruption("unknown value tag".into())),
        }
    }
}
