//! In-process broker for agent tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cloudplay_protocol::proto::broker_client::BrokerClient;
use cloudplay_protocol::proto::signaling_client::SignalingClient;
use cloudplay_protocol::{CloudplayConfig, GameMetadata, SessionId};
use cloudplay_server::broker::Broker;
use cloudplay_server::{build_broker, grpc};
use tokio::net::TcpListener;
use tonic::transport::Channel;

pub const HOST: &str = "test-host";

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub addr: SocketAddr,
}

impl TestBroker {
    pub async fn start() -> Self {
        let mut config = CloudplayConfig::default();
        config.allocator.hosts = vec![HOST.to_string()];
        config.games = vec![GameMetadata::new("chess", "chess --fullscreen")];
        let broker = build_broker(&config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(grpc::serve(
            listener,
            Arc::clone(&broker),
            Duration::from_millis(10),
            std::future::pending(),
        ));
        Self { broker, addr }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn new_session(&self) -> SessionId {
        self.broker.new_game("chess").await.unwrap().id
    }

    pub async fn broker_client(&self) -> BrokerClient<Channel> {
        BrokerClient::connect(self.url()).await.unwrap()
    }

    pub async fn signaling_client(&self) -> SignalingClient<Channel> {
        SignalingClient::connect(self.url()).await.unwrap()
    }
}

/// Offer body shaped the way a browser sends it. The SDP itself is not parsed.
pub fn offer_body() -> String {
    STANDARD.encode(r#"{"type":"offer","sdp":"v=0\r\n"}"#)
}
