#![doc = include_str!("../README.md")]

pub mod address;
pub mod context;
pub mod ep;
pub mod request;
pub mod tag;
pub mod wireup;
pub mod worker;

pub use {
    ep::{EpId, Endpoint},
    request::{RecvHandle, RecvOutcome, ReqId, RequestHandle, SendBuffer},
    tag::Tag,
    worker::Worker,
};
