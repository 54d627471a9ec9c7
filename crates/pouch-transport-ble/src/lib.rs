//! BLE GATT wire layer for the Pouch gateway.
//!
//! Holds the Pouch service and characteristic identifiers, advertisement
//! parsing and the frame packetizer. Enable the `btleplug` feature for a
//! `Radio` backed by the host Bluetooth stack.

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
pub mod packetizer;
pub mod protocol;

pub use packetizer::{
    decode, encode_all, DecodedPacket, Fill, FillStatus, Packet, PacketAssembler, PacketSource,
    Packetizer, PacketizerError, SliceSource,
};
pub use protocol::{find_pouch_adv, AdvData, Characteristic, POUCH_GATT_VERSION};
