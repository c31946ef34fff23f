//! Fake broker fixture: accepts one connection at a time and lets a test
//! drive both ends of the wire protocol by hand.

use bytes::BytesMut;
use pulsar_producer_core::{BrokerFrame, Command, WireCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

pub async fn start_fake_broker() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (format!("pulsar://{}:{}", addr.ip(), addr.port()), listener)
}

pub struct FakeBrokerConn {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    carry: BytesMut,
    codec: WireCodec,
}

impl FakeBrokerConn {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _): (TcpStream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            read_half,
            write_half,
            carry: BytesMut::new(),
            codec: WireCodec,
        }
    }

    pub async fn recv_command(&mut self) -> Command {
        loop {
            if let Some(cmd) = self.codec.decode_command(&mut self.carry).unwrap() {
                return cmd;
            }
            let mut buf = [0u8; 4096];
            let n = self.read_half.read(&mut buf).await.unwrap();
            assert!(n > 0, "fake broker: connection closed unexpectedly");
            self.carry.extend_from_slice(&buf[..n]);
        }
    }

    pub async fn send(&mut self, frame: BrokerFrame) {
        let bytes = self.codec.encode_broker_frame(frame);
        self.write_half.write_all(&bytes).await.unwrap();
    }

    /// Performs the Connect -> Connected, CreateProducer -> ProducerSuccess
    /// handshake and returns the producer_id the client used.
    pub async fn complete_handshake(&mut self, producer_name: &str) -> u64 {
        assert!(matches!(self.recv_command().await, Command::Connect { .. }));
        self.send(BrokerFrame::Connected).await;

        let (producer_id, request_id) = match self.recv_command().await {
            Command::CreateProducer {
                producer_id,
                request_id,
                ..
            } => (producer_id, request_id),
            other => panic!("expected CreateProducer, got {other:?}"),
        };
        self.send(BrokerFrame::ProducerSuccess {
            request_id,
            producer_name: producer_name.to_string(),
        })
        .await;
        producer_id
    }

    /// Drops the connection, as if the broker (or network) vanished.
    pub async fn disconnect(self) {
        drop(self.write_half);
    }
}
