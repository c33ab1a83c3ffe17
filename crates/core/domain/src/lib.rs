pub mod data;
pub mod setting;

pub use data::{PolledValue, PolledValueMap};
pub use setting::{
    EnumState, GroupDescriptor, Parity, PointLocation, SerialDescriptor, ServerDescriptor,
    TransportKind,
};
