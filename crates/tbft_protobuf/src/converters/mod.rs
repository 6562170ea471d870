pub mod consensus;
#[cfg(test)]
#[path = "consensus_test.rs"]
mod consensus_test;

use prost::DecodeError;

#[derive(thiserror::Error, PartialEq, Debug, Clone)]
pub enum ProtobufConversionError {
    #[error("Type `{type_description}` got out of range value {value_as_str}")]
    OutOfRangeValue { type_description: &'static str, value_as_str: String },
    #[error("Missing field `{field_description}`")]
    MissingField { field_description: &'static str },
    #[error(transparent)]
    DecodeError(#[from] DecodeError),
}

pub(crate) fn missing(field_description: &'static str) -> ProtobufConversionError {
    ProtobufConversionError::MissingField { field_description }
}

#[macro_export]
macro_rules! auto_impl_into_and_try_from_vec_u8 {
    ($T:ty, $ProtobufT:ty) => {
        impl From<$T> for Vec<u8> {
            fn from(value: $T) -> Self {
                let protobuf_value = <$ProtobufT>::from(value);
                protobuf_value.encode_to_vec()
            }
        }
        $crate::auto_impl_try_from_vec_u8!($T, $ProtobufT);
    };
}

#[macro_export]
macro_rules! auto_impl_try_from_vec_u8 {
    ($T:ty, $ProtobufT:ty) => {
        impl TryFrom<Vec<u8>> for $T {
            type Error = $crate::converters::ProtobufConversionError;
            fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
                let protobuf_value = <$ProtobufT>::decode(&value[..])?;
                <$T>::try_from(protobuf_value)
            }
        }
    };
}
