//! Property-Based Tests for the CM transport: framing, codec, channel cipher, job ids

use std::collections::HashSet;
use std::time::Duration;

use bytes::{Bytes, BufMut};
use proptest::prelude::*;
use steamcm_transport::message::{pack_multi, unpack_multi};
use steamcm_transport::protocol::{decode_envelope, encode_envelope, FrameDecoder, MAGIC};
use steamcm_transport::{
    decode_message, ChannelCipher, JobId, JobIdAllocator, MsgType, PacketMsg, ReconnectPolicy,
    SessionKey, TransportError,
};

use crate::harness::test_universe_key;

fn msg_type_strategy() -> impl Strategy<Value = MsgType> {
    prop_oneof![
        Just(MsgType::SERVICE_METHOD),
        Just(MsgType::SERVICE_METHOD_RESPONSE),
        Just(MsgType::CLIENT_HEART_BEAT),
        Just(MsgType::CLIENT_CM_LIST),
        (2u32..0x7FFF_FFFF).prop_map(MsgType),
    ]
}

/// Feeds `stream` to a decoder in pieces of the given sizes and collects every frame.
fn decode_in_chunks(stream: &[u8], chunk_sizes: &[usize]) -> Vec<Vec<u8>> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut offset = 0;
    let mut sizes = chunk_sizes.iter().cycle();
    while offset < stream.len() {
        let size = sizes.next().copied().unwrap_or(1).max(1);
        let end = (offset + size).min(stream.len());
        decoder.buffer_mut().put_slice(&stream[offset..end]);
        offset = end;
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
    }
    assert_eq!(decoder.buffered(), 0);
    frames
}

#[test]
fn t_envelope_magic_is_vt01() {
    assert_eq!(&MAGIC.to_le_bytes(), b"VT01");
}

#[test]
fn t_partial_envelope_waits_for_more() {
    let frame = encode_envelope(b"0123456789");
    let mut decoder = FrameDecoder::new();
    decoder.buffer_mut().put_slice(&frame[..frame.len() - 1]);
    assert!(decoder.next_frame().unwrap().is_none());
    decoder.buffer_mut().put_slice(&frame[frame.len() - 1..]);
    assert_eq!(decoder.next_frame().unwrap().unwrap(), b"0123456789");
}

#[test]
fn t_job_id_sequence_starts_at_one() {
    let allocator = JobIdAllocator::with_identity(3, 9);
    let first = allocator.next_job_id();
    let second = allocator.next_job_id();
    assert_eq!(first.sequence(), 1);
    assert_eq!(second.sequence(), 2);
    assert_eq!(first.process_id(), 3);
    assert_eq!(first.box_id(), 9);
    assert_eq!(first.start_time(), allocator.start_time());
}

proptest! {
    #[test]
    fn prop_stream_splits_into_original_frames(
        bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        chunk_sizes in prop::collection::vec(1usize..64, 1..8),
    ) {
        let stream: Vec<u8> = bodies.iter().flat_map(|b| encode_envelope(b)).collect();
        let frames = decode_in_chunks(&stream, &chunk_sizes);
        prop_assert_eq!(frames, bodies);
    }

    #[test]
    fn prop_wrong_magic_rejected(body in prop::collection::vec(any::<u8>(), 0..64), magic in any::<u32>()) {
        prop_assume!(magic != MAGIC);
        let mut frame = encode_envelope(&body);
        frame[4..8].copy_from_slice(&magic.to_le_bytes());
        let is_invalid_magic = matches!(decode_envelope(&frame), Err(TransportError::InvalidMagic { .. }));
        prop_assert!(is_invalid_magic);
    }

    #[test]
    fn prop_envelope_length_must_match(body in prop::collection::vec(any::<u8>(), 1..64), cut in 1usize..64) {
        let frame = encode_envelope(&body);
        let cut = cut.min(body.len());
        let is_mismatch = matches!(
            decode_envelope(&frame[..frame.len() - cut]),
            Err(TransportError::LengthMismatch { .. })
        );
        prop_assert!(is_mismatch);
    }

    #[test]
    fn prop_proto_header_survives_codec(
        msg_type in msg_type_strategy(),
        source in any::<u64>(),
        target in any::<u64>(),
        body in prop::collection::vec(any::<u8>(), 0..256),
        payload in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut packet = PacketMsg::new_proto(msg_type, body.clone())
            .with_target_job(JobId(target))
            .with_payload(payload.clone());
        packet.header.set_source_job(JobId(source));

        let decoded = decode_message(&packet.encode()).unwrap();
        prop_assert!(decoded.is_proto());
        prop_assert_eq!(decoded.msg_type, msg_type);
        prop_assert_eq!(decoded.source_job(), JobId(source));
        prop_assert_eq!(decoded.target_job(), JobId(target));
        prop_assert_eq!(&decoded.body[..], &body[..]);
        prop_assert_eq!(&decoded.payload[..], &payload[..]);
    }

    #[test]
    fn prop_struct_header_survives_codec(
        msg_type in msg_type_strategy(),
        target in any::<u64>(),
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let packet = PacketMsg::new_struct(msg_type, body.clone()).with_target_job(JobId(target));
        let decoded = decode_message(&packet.encode()).unwrap();
        prop_assert!(!decoded.is_proto());
        prop_assert_eq!(decoded.msg_type, msg_type);
        prop_assert_eq!(decoded.target_job(), JobId(target));
        prop_assert_eq!(&decoded.body[..], &body[..]);
    }

    #[test]
    fn prop_raw_type_keeps_proto_flag(code in 0u32..0x8000_0000, proto in any::<bool>()) {
        let raw = MsgType(code).to_raw(proto);
        prop_assert_eq!(MsgType::from_raw(raw), (MsgType(code), proto));
    }

    #[test]
    fn prop_multi_preserves_order(bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..128), 0..10)) {
        let packed = pack_multi(bodies.iter());
        let decoded = decode_message(&packed.encode()).unwrap();
        prop_assert_eq!(decoded.msg_type, MsgType::MULTI);
        prop_assert_eq!(unpack_multi(&decoded).unwrap(), bodies);
    }

    #[test]
    fn prop_cipher_detects_tampering(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let cipher = ChannelCipher::new(&SessionKey::generate()).unwrap();
        let mut frame = cipher.encrypt(&plaintext).unwrap();
        prop_assert_eq!(cipher.decrypt(&frame).unwrap(), plaintext);

        let index = position.index(frame.len());
        frame[index] ^= flip;
        prop_assert!(cipher.decrypt(&frame).is_err());
    }

    #[test]
    fn prop_job_ids_unique(count in 1usize..2000, process_id in any::<u8>(), box_id in 0u16..1024) {
        let allocator = JobIdAllocator::with_identity(process_id, box_id);
        let mut seen = HashSet::new();
        for expected in 1..=count as u32 {
            let id = allocator.next_job_id();
            prop_assert!(!id.is_none());
            prop_assert_eq!(id.sequence(), expected);
            prop_assert!(seen.insert(id));
        }
    }

    #[test]
    fn prop_backoff_grows_and_caps(initial in 1u64..1000, max in 1000u64..60_000, attempt in 0u32..40) {
        let policy = ReconnectPolicy {
            initial_backoff_ms: initial,
            max_backoff_ms: max,
            jitter: false,
            ..ReconnectPolicy::default()
        };
        let delay = policy.backoff(attempt);
        prop_assert!(delay <= Duration::from_millis(max));
        prop_assert!(delay >= Duration::from_millis(initial));
        prop_assert!(policy.backoff(attempt + 1) >= delay);
    }

    #[test]
    fn prop_jitter_stays_within_half(attempt in 0u32..10) {
        let policy = ReconnectPolicy::default();
        let base = ReconnectPolicy { jitter: false, ..policy.clone() }.backoff(attempt);
        let jittered = policy.backoff(attempt);
        prop_assert!(jittered >= base);
        prop_assert!(jittered <= base + base / 2);
    }
}

proptest! {
    // RSA operations are slow in debug builds.
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_session_key_bound_to_challenge(challenge in prop::array::uniform16(any::<u8>()), other in prop::array::uniform16(any::<u8>())) {
        prop_assume!(challenge != other);
        let server_key = test_universe_key();
        let key = SessionKey::generate();
        let wrapped = server_key.public_key().wrap_session_key(&key, &challenge).unwrap();
        prop_assert_eq!(server_key.unwrap_session_key(&wrapped, &challenge).unwrap().0, key.0);
        prop_assert!(server_key.unwrap_session_key(&wrapped, &other).is_err());
        prop_assert!(!wrapped.windows(key.0.len()).any(|w| w == key.0.as_slice()));
    }
}

#[test]
fn t_pack_multi_accepts_bytes() {
    let packed = pack_multi([Bytes::from_static(b"x"), Bytes::from_static(b"yz")]);
    assert_eq!(
        unpack_multi(&packed).unwrap(),
        vec![b"x".to_vec(), b"yz".to_vec()]
    );
}
