#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use scanbridge_core::{CapabilityCodec, LegacyMemory, MemoryBroker, NegotiatedMemory};
use scanbridge_proto::{CapabilityId, ItemType, payloads::CapabilityRecord};

// Layout: [table: u8][con_type: u16 LE][requested: u16 LE][container bytes...]
//
// Whatever the bytes, decoding must hand every block back to the table.
fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }
    let memory: Arc<dyn MemoryBroker> = if data[0] & 1 == 0 {
        Arc::new(LegacyMemory::new())
    } else {
        Arc::new(NegotiatedMemory::new())
    };
    let con_type = u16::from_le_bytes([data[1], data[2]]);
    let requested = ItemType::from_u16(u16::from_le_bytes([data[3], data[4]]));
    let bytes = &data[5..];

    let Ok(handle) = memory.allocate(bytes.len()) else {
        return;
    };
    memory.lock(handle).expect("fresh block locks");
    memory.write(handle, 0, bytes).expect("fresh block is writable");
    memory.unlock(handle).expect("locked block unlocks");

    let record = CapabilityRecord { cap: CapabilityId(0x8000), con_type, container: Some(handle) };
    let codec = CapabilityCodec::new(Arc::clone(&memory));
    let _ = codec.decode(&record, requested);

    assert_eq!(memory.stats().live(), 0);
});
