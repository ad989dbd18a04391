#![no_main]

use libfuzzer_sys::fuzz_target;
use pyrite_wire::codec::{decode_event, PacketHeader, WireReader, HEADER_LEN};

mod utils;

fuzz_target!(|data: &[u8]| {
    let input = utils::truncate(data);

    if let Some(header) = input.first_chunk::<HEADER_LEN>() {
        let _ = PacketHeader::parse(header);
    }

    if let [hi, lo, payload @ ..] = input {
        let _ = decode_event(u16::from_be_bytes([*hi, *lo]), payload);
    }

    // Every reply decoder must reject truncated or oversized payloads cleanly.
    let _ = WireReader::new(input).read_breakpoint_acks();
    let _ = WireReader::new(input).read_threads();
    let _ = WireReader::new(input).read_frames();
    let _ = WireReader::new(input).read_variables();
    let _ = WireReader::new(input).read_strings();
});
