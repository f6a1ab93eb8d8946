// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Canonical byte encoding. Block hashing, proof of work and operation
//! signing all run over these bytes, so every miner on the network must
//! use the exact same configuration.

pub const CODEC_BYTES_LIMIT: usize = 1_000_000;

pub fn encode_to_vec<T: bincode::Encode>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let config = bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .with_limit::<CODEC_BYTES_LIMIT>();

    bincode::encode_to_vec(val, config)
}

pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    let config = bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .with_limit::<CODEC_BYTES_LIMIT>();

    bincode::decode_from_slice(bytes, config).map(|r| r.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::{Decode, Encode};

    #[derive(Encode, Decode, PartialEq, Debug)]
    struct TestStruct {
        a: u32,
        b: String,
        c: Vec<u8>,
    }

    #[test]
    fn encode_decode_roundtrip() {
        let val = TestStruct {
            a: 0xdead_beef,
            b: "M 0 0 L 0 5".to_owned(),
            c: vec![0xff, 0x00, 0x01],
        };
        let encoded = encode_to_vec(&val).unwrap();
        let decoded: TestStruct = decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, val);
    }

    #[test]
    fn encoding_is_deterministic() {
        let val = TestStruct {
            a: 42,
            b: "circle x:5 y:5 r:2".to_owned(),
            c: vec![],
        };
        assert_eq!(encode_to_vec(&val).unwrap(), encode_to_vec(&val).unwrap());
    }

    #[test]
    fn single_byte_vec_u8() {
        let input: Vec<u8> = vec![0xff, 0xff];
        let encoded = encode_to_vec(&input).unwrap();
        assert_eq!(encoded.as_slice(), &[0x02, 0xff, 0xff]);
    }
}
