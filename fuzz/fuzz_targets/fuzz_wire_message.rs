//! Fuzz target for wire message decoding.
//!
//! Every protocol's request decoder and the response envelope must reject
//! arbitrary input with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shardmesh_p2p::message::{
    DiscoveryRequest, FederatedSearchRequest, MetadataSyncRequest, ShardDiscoveryRequest,
    ShardSyncRequest, ShardTransferRequest,
};
use shardmesh_p2p::{Response, WireRequest};

fn check<R: WireRequest>(data: &[u8]) {
    if let Ok(request) = R::decode(data) {
        assert!(R::ACTIONS.contains(&request.action()));
        let _ = request.encode();
    }
}

fuzz_target!(|data: &[u8]| {
    check::<DiscoveryRequest>(data);
    check::<ShardDiscoveryRequest>(data);
    check::<ShardTransferRequest>(data);
    check::<ShardSyncRequest>(data);
    check::<MetadataSyncRequest>(data);
    check::<FederatedSearchRequest>(data);

    if let Ok(response) = Response::decode(data) {
        let _ = response.into_data::<serde_json::Value>();
    }
    let _ = serde_json::from_slice::<shardmesh_types::ShardMetadata>(data);
});
