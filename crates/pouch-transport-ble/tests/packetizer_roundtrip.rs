use pouch_transport_ble::packetizer::{encode_all, PacketAssembler};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn reassemble(frames: &[bytes::Bytes]) -> (Vec<u8>, usize, usize) {
    let mut assembler = PacketAssembler::default();
    let mut out = Vec::new();
    let mut firsts = 0;
    let mut lasts = 0;
    for frame in frames {
        let packet = assembler.accept(frame).unwrap();
        firsts += usize::from(packet.is_first);
        lasts += usize::from(packet.is_last);
        out.extend_from_slice(packet.payload);
    }
    assert!(assembler.is_done());
    (out, firsts, lasts)
}

#[test]
fn randomized_payloads_survive_any_frame_size() {
    let mut rng = StdRng::seed_from_u64(0x504f_5543);
    for _ in 0..200 {
        let len = rng.gen_range(0..600);
        let payload_room = rng.gen_range(1..80);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

        let frames = encode_all(&payload, payload_room + 1).unwrap();
        assert!(frames.iter().all(|f| f.len() <= payload_room + 1));

        let (out, firsts, lasts) = reassemble(&frames);
        assert_eq!(out, payload, "len={len} room={payload_room}");
        assert_eq!(firsts, 1);
        assert_eq!(lasts, 1);
    }
}

#[test]
fn payload_exactly_one_frame_long() {
    let payload = vec![7u8; 20];
    let frames = encode_all(&payload, 21).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], 0x03);
    assert_eq!(reassemble(&frames).0, payload);
}

#[test]
fn empty_payload_roundtrips() {
    let frames = encode_all(&[], 2).unwrap();
    let (out, firsts, lasts) = reassemble(&frames);
    assert!(out.is_empty());
    assert_eq!((firsts, lasts), (1, 1));
}

#[test]
fn one_byte_frames_split_every_byte() {
    let payload = b"pouch".to_vec();
    let frames = encode_all(&payload, 2).unwrap();
    assert_eq!(frames.len(), payload.len());
    assert_eq!(reassemble(&frames).0, payload);
}
