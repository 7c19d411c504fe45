#![no_main]

use libfuzzer_sys::fuzz_target;
use scanbridge_proto::{container::ContainerView, Container, ContainerShape, ItemType};

// Layout: [shape: u16 LE][requested item type: u16 LE][container bytes...]
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let Ok(shape) = ContainerShape::from_u16(u16::from_le_bytes([data[0], data[1]])) else {
        return;
    };
    let requested = ItemType::from_u16(u16::from_le_bytes([data[2], data[3]]));
    let bytes = &data[4..];

    if let Ok(view) = ContainerView::parse(shape, bytes) {
        if let Ok(item_type) = view.effective_type(requested) {
            for index in 0..view.count().min(4096) {
                let _ = view.item_bytes(item_type, index);
            }
        }
    }

    if let Ok(container) = Container::decode(shape, bytes, requested) {
        assert_eq!(container.shape(), shape);
        if let Ok(encoded) = container.encode() {
            assert_eq!(encoded.len(), container.buffer_size());
        }
    }
});
