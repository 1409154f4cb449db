//! Generates the gRPC client/server stubs for the broker and signaling
//! services. Message types live in `src/proto.rs` and are written by hand,
//! so no `protoc` is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let broker = Service::builder()
        .name("Broker")
        .package("cloudplay")
        .method(unary(
            "find_session",
            "FindSession",
            "FindSessionRequest",
            "FindSessionResponse",
        ))
        .method(
            Method::builder()
                .name("watch_session")
                .route_name("WatchSession")
                .input_type("crate::proto::WatchSessionRequest")
                .output_type("crate::proto::WatchSessionResponse")
                .codec_path(CODEC)
                .server_streaming()
                .build(),
        )
        .method(unary(
            "delete_session",
            "DeleteSession",
            "DeleteSessionRequest",
            "DeleteSessionResponse",
        ))
        .method(unary(
            "get_game_metadata",
            "GetGameMetadata",
            "GetGameMetadataRequest",
            "GetGameMetadataResponse",
        ))
        .build();

    let signaling = Service::builder()
        .name("Signaling")
        .package("cloudplay")
        .method(unary(
            "receive_signaling_offer",
            "ReceiveSignalingOffer",
            "ReceiveSignalingOfferRequest",
            "ReceiveSignalingOfferResponse",
        ))
        .method(unary(
            "send_signaling_answer",
            "SendSignalingAnswer",
            "SendSignalingAnswerRequest",
            "SendSignalingAnswerResponse",
        ))
        .method(
            Method::builder()
                .name("trickle_signaling")
                .route_name("TrickleSignaling")
                .input_type("crate::proto::TrickleSignalingRequest")
                .output_type("crate::proto::TrickleSignalingResponse")
                .codec_path(CODEC)
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[broker, signaling]);
}
