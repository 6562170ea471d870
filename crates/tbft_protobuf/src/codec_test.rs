use assert_matches::assert_matches;

use crate::codec::{FrameError, ProstFrameCodec};
use crate::protobuf::Endorsement;

const MAX_LEN: usize = 1024;

fn endorsement(signer: &[u8]) -> Endorsement {
    Endorsement { signer: signer.to_vec(), signature: vec![7; 32] }
}

#[test]
fn decodes_consecutive_frames() {
    let codec = ProstFrameCodec::<Endorsement>::new(MAX_LEN);
    let mut buf = codec.encode(&endorsement(b"first"));
    buf.extend(codec.encode(&endorsement(b"second")));

    let (first, consumed) = codec.decode(&buf).unwrap().unwrap();
    assert_eq!(first, endorsement(b"first"));
    let (second, rest) = codec.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, endorsement(b"second"));
    assert_eq!(consumed + rest, buf.len());
}

#[test]
fn incomplete_frame_needs_more_bytes() {
    let codec = ProstFrameCodec::<Endorsement>::new(MAX_LEN);
    let buf = codec.encode(&endorsement(b"torn"));

    assert!(codec.decode(&buf[..buf.len() - 1]).unwrap().is_none());
    assert!(codec.decode(&[]).unwrap().is_none());
}

#[test]
fn oversized_frame_is_rejected() {
    let codec = ProstFrameCodec::<Endorsement>::new(8);
    let buf = codec.encode(&endorsement(b"does not fit"));

    assert_matches!(codec.decode(&buf), Err(FrameError::FrameTooLarge { max: 8, .. }));
}
