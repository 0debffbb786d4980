use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

use termchat::client::{self, Registration};
use termchat::protocol::{read_message, write_message, MAX_BODY_LEN};
use termchat::{Message, Received, Server, ServerConfig, ServerError};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Server running on its own single-threaded runtime, as in the binary.
struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(ServerConfig::new(0).with_host("127.0.0.1"))
    }

    fn start_with(config: ServerConfig) -> Self {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let server = Server::bind(&config).await?;
                let _ = addr_tx.send(server.local_addr()?);
                server
                    .run_until(async move {
                        let _ = shutdown_rx.await;
                    })
                    .await
            })
        });

        let addr = addr_rx.recv().expect("server failed to start");
        Self {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    fn stop(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.thread
            .take()
            .expect("server thread")
            .join()
            .expect("server thread panicked")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

struct TestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect and consume the welcome prompt.
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self { reader, writer };
        let welcome = client.recv_text().await;
        assert!(welcome.contains("username"), "got {welcome:?}");
        client
    }

    /// Connect, register and consume the roster.
    async fn register(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(&Message::ClientRegistration {
                username: name.to_string(),
            })
            .await;
        assert_eq!(client.recv().await, Received::Message(Message::RegistrationSuccess));
        let roster = client.recv_text().await;
        assert!(roster.contains(&format!(" - {name} (you)")), "got {roster:?}");
        client
    }

    async fn send(&mut self, message: &Message) {
        write_message(&mut self.writer, message).await.unwrap();
    }

    async fn say(&mut self, line: &str) {
        self.send(&Message::ClientMessage {
            content: line.to_string(),
            recipient: None,
        })
        .await;
    }

    async fn recv(&mut self) -> Received {
        timeout(READ_TIMEOUT, read_message(&mut self.reader))
            .await
            .expect("timed out waiting for the server")
            .unwrap()
    }

    async fn recv_text(&mut self) -> String {
        match self.recv().await {
            Received::Message(Message::ServerMessage { content }) => content,
            other => panic!("expected server text, got {other:?}"),
        }
    }

    async fn expect_text(&mut self, needle: &str) -> String {
        let text = self.recv_text().await;
        assert!(text.contains(needle), "expected {needle:?} in {text:?}");
        text
    }

    /// Nothing arrives for a short while. Only call this last.
    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(200), read_message(&mut self.reader)).await;
        assert!(result.is_err(), "unexpected frame: {result:?}");
    }
}

#[tokio::test]
async fn registration_scenario() {
    let server = TestServer::start();
    let mut client = TestClient::connect(server.addr).await;

    client
        .send(&Message::ClientRegistration {
            username: "abc".to_string(),
        })
        .await;

    assert_eq!(client.recv().await, Received::Message(Message::RegistrationSuccess));
    let roster = client.expect_text("Currently active users").await;
    assert!(roster.contains(" - abc (you)"));

    server.stop().unwrap();
}

#[tokio::test]
async fn invalid_and_taken_usernames_are_retried() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut other = TestClient::connect(server.addr).await;

    other
        .send(&Message::ClientRegistration {
            username: "Alice!".to_string(),
        })
        .await;
    other.expect_text("not a valid user name").await;

    other
        .send(&Message::ClientRegistration {
            username: "alice".to_string(),
        })
        .await;
    other.expect_text("taken").await;

    other
        .send(&Message::ClientRegistration {
            username: "alice2".to_string(),
        })
        .await;
    assert_eq!(other.recv().await, Received::Message(Message::RegistrationSuccess));
    let roster = other.recv_text().await;
    assert!(roster.contains(" - alice\n"));
    assert!(roster.contains(" - alice2 (you)"));

    alice.expect_text("alice2 is here!").await;
}

#[tokio::test]
async fn unregistered_client_cannot_chat() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut stranger = TestClient::connect(server.addr).await;

    stranger.say("alice hello").await;
    stranger.expect_text("register").await;
    alice.expect_silence().await;
}

#[tokio::test]
async fn private_message_scenario() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;
    let mut carol = TestClient::register(server.addr, "carol").await;
    alice.expect_text("carol is here!").await;
    bob.expect_text("carol is here!").await;

    alice.say("bob hi").await;

    let delivered = bob.expect_text("alice to you:").await;
    assert!(delivered.contains("  hi"));
    alice.expect_text("Message sent to bob").await;
    carol.expect_silence().await;
}

#[tokio::test]
async fn pre_addressed_message_uses_recipient_field() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;

    alice
        .send(&Message::ClientMessage {
            content: "hello there bob".to_string(),
            recipient: Some("bob".to_string()),
        })
        .await;

    bob.expect_text("hello there bob").await;
    alice.expect_text("Message sent to bob").await;
}

#[tokio::test]
async fn note_to_self() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;

    alice.say("alice buy milk").await;
    let note = alice.expect_text("Note to self:").await;
    assert!(note.contains("buy milk"));
    alice.expect_silence().await;
}

#[tokio::test]
async fn unknown_recipient_scenario() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;

    alice.say("ghost hello").await;
    alice.expect_text("doesn't exist").await;

    alice.say("Not/A/Name hello").await;
    alice.expect_text("Invalid user name").await;

    alice.say("nospace").await;
    alice.expect_text("empty message").await;

    bob.expect_silence().await;
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_sender() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;
    let mut carol = TestClient::register(server.addr, "carol").await;
    alice.expect_text("carol is here!").await;
    bob.expect_text("carol is here!").await;

    alice.say("bc hello all").await;

    bob.expect_text("alice to everyone:").await;
    carol.expect_text("alice to everyone:").await;
    alice.expect_text("Message sent to everyone").await;
    alice.expect_silence().await;
}

#[tokio::test]
async fn disconnect_mid_session_scenario() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;

    drop(bob);

    alice.expect_text("bob has been disconnected.").await;
    alice.say("bob are you there").await;
    alice.expect_text("doesn't exist").await;
}

#[tokio::test]
async fn orderly_disconnect_is_announced_as_leaving() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;

    bob.send(&Message::Disconnect).await;

    alice.expect_text("bob has left.").await;
    // The server closes bob's connection
    assert_eq!(bob.recv().await, Received::Closed);
}

#[tokio::test]
async fn malformed_frames_get_a_retry_prompt() {
    let server = TestServer::start();
    let mut client = TestClient::connect(server.addr).await;

    // Unknown kind with a small body
    let mut junk = vec![42u8];
    junk.extend_from_slice(&4u64.to_be_bytes());
    junk.extend_from_slice(b"junk");
    client.writer.write_all(&junk).await.unwrap();
    client.expect_text("say it again").await;

    // Still able to register afterwards
    client
        .send(&Message::ClientRegistration {
            username: "survivor".to_string(),
        })
        .await;
    assert_eq!(client.recv().await, Received::Message(Message::RegistrationSuccess));
}

#[tokio::test]
async fn oversize_header_is_rejected() {
    let server = TestServer::start();
    let mut client = TestClient::connect(server.addr).await;

    let declared = MAX_BODY_LEN + 904;
    let mut frame = vec![1u8];
    frame.extend_from_slice(&(declared as u64).to_be_bytes());
    frame.extend_from_slice(&vec![b'x'; declared]);
    client.writer.write_all(&frame).await.unwrap();

    client.expect_text("say it again").await;

    // The body was skipped, so the stream is still aligned
    client
        .send(&Message::ClientRegistration {
            username: "alice".to_string(),
        })
        .await;
    assert_eq!(client.recv().await, Received::Message(Message::RegistrationSuccess));
}

#[tokio::test]
async fn stalled_partial_frame_is_dropped() {
    let server = TestServer::start_with(
        ServerConfig::new(0)
            .with_host("127.0.0.1")
            .with_drain_timeout(Duration::from_millis(200)),
    );
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;

    bob.writer.write_all(&[0, 0, 0]).await.unwrap();

    alice.expect_text("bob has been disconnected.").await;
    // Loop still serves others while and after bob stalls
    alice.say("alice still here").await;
    alice.expect_text("Note to self:").await;
}

#[tokio::test]
async fn shutdown_notifies_clients() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut pending = TestClient::connect(server.addr).await;

    server.stop().unwrap();

    alice.expect_text("shutting down").await;
    assert_eq!(alice.recv().await, Received::Message(Message::Disconnect));
    pending.expect_text("shutting down").await;
    assert_eq!(pending.recv().await, Received::Message(Message::Disconnect));
}

#[tokio::test]
async fn message_too_long_to_forward_is_refused() {
    let server = TestServer::start();
    let mut alice = TestClient::register(server.addr, "alice").await;
    let mut bob = TestClient::register(server.addr, "bob").await;
    alice.expect_text("bob is here!").await;

    // Fits in a client frame, but not once prefixed and indented
    alice.say(&format!("bc {}", "x".repeat(4080))).await;

    alice.expect_text("too long").await;
    bob.expect_silence().await;
}

#[tokio::test]
async fn piped_input_chats_right_after_registering() {
    let server = TestServer::start();
    let mut bob = TestClient::register(server.addr, "bob").await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let registration = Arc::new(watch::Sender::new(Registration::Connecting));

    let printer_state = registration.clone();
    let printer = tokio::spawn(async move {
        let mut out = Vec::new();
        client::print_incoming(&mut reader, &mut out, &printer_state).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&out).into_owned())
    });

    client::forward_input(&b"alice\nbc hello everyone\n"[..], &mut writer, &registration)
        .await
        .unwrap();

    bob.expect_text("alice is here!").await;
    let broadcast = bob.expect_text("alice to everyone:").await;
    assert!(broadcast.contains("hello everyone"));
    bob.expect_text("alice has left.").await;

    let printed = timeout(READ_TIMEOUT, printer).await.unwrap().unwrap().unwrap();
    assert!(printed.contains("Message sent to everyone."), "got {printed:?}");
    assert!(!printed.contains("already registered"), "got {printed:?}");
}
