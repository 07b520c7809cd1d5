//! Generated protobuf and gRPC code for `exchangerate.v1`.

tonic::include_proto!("exchangerate.v1");

/// Encoded descriptor set, registered with the reflection service.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("exchangerate_descriptor");
