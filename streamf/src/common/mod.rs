// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod address;
pub mod endpoint;
pub mod stream;

pub use address::RemoteAddr;
pub use endpoint::{Endpoint, Frame, MessageEndpoint};
pub use stream::{Close, StreamReader, StreamWriter, TunnelStream, WrappedStream};
