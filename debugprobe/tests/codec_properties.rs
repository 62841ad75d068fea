/// Property tests for JDWP framing

use bytes::BytesMut;
use debugprobe::{Packet, PacketCodec, PacketKind};
use proptest::prelude::*;
use tokio_util::codec::Decoder;

fn command_packet() -> impl Strategy<Value = Packet> {
    (
        any::<u32>(),
        any::<u8>(),
        any::<u8>(),
        proptest::collection::vec(any::<u8>(), 0..256),
    )
        .prop_map(|(id, command_set, command, payload)| {
            Packet::command(id, command_set, command, payload)
        })
}

proptest! {
    #[test]
    fn round_trip_preserves_request(packet in command_packet()) {
        let mut codec = PacketCodec::new();
        let frame = codec.encode_to_vec(packet.clone()).unwrap();
        prop_assert_eq!(frame.len(), 11 + packet.payload.len());

        let mut buf = BytesMut::from(&frame[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded.id, packet.id);
        prop_assert_eq!(decoded.kind, packet.kind);
        prop_assert_eq!(decoded.payload, packet.payload);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn byte_at_a_time_reassembly_yields_one_packet(packet in command_packet()) {
        let mut codec = PacketCodec::new();
        let frame = codec.encode_to_vec(packet.clone()).unwrap();

        let mut buf = BytesMut::new();
        let mut completed = Vec::new();
        let mut incomplete = 0usize;
        for byte in frame {
            buf.extend_from_slice(&[byte]);
            match codec.decode(&mut buf).unwrap() {
                Some(decoded) => completed.push(decoded),
                None => incomplete += 1,
            }
        }

        prop_assert_eq!(completed.len(), 1);
        prop_assert_eq!(incomplete, 10 + packet.payload.len());
        let decoded = &completed[0];
        prop_assert_eq!(decoded.id, packet.id);
        prop_assert_eq!(decoded.kind, packet.kind);
        prop_assert_eq!(&decoded.payload, &packet.payload);
    }
}
