use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf},
    select,
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, info};

use crate::{
    config::SessionOptions,
    hub::{Client, ClientId, HubHandle, Line},
    idle::{self, ActivityFlag, IdleOutcome},
    outbound,
};

type Lines<S> = FramedRead<ReadHalf<S>, LinesCodec>;

/// Runs one connection from handshake to departure.
///
/// The connection is closed once this returns and the hub has released the
/// client's outbound queue.
pub async fn run<S>(
    stream: S,
    peer: String,
    hub: HubHandle,
    options: Arc<SessionOptions>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let closer = CancellationToken::new();
    let activity = ActivityFlag::new();

    if let Some(period) = options.idle_timeout.filter(|period| !period.is_zero()) {
        spawn_idle_monitor(period, &peer, &activity, &closer);
    }

    let result = serve(stream, &peer, &hub, &options, &closer, &activity).await;
    closer.cancel();
    result
}

fn spawn_idle_monitor(
    period: Duration,
    peer: &str,
    activity: &ActivityFlag,
    closer: &CancellationToken,
) {
    let peer = peer.to_string();
    let activity = activity.clone();
    let closer = closer.clone();
    tokio::spawn(async move {
        if idle::monitor(period, activity, closer).await == IdleOutcome::TimedOut {
            info!(%peer, ?period, "closing idle connection");
        }
    });
}

async fn serve<S>(
    stream: S,
    peer: &str,
    hub: &HubHandle,
    options: &SessionOptions,
    closer: &CancellationToken,
    activity: &ActivityFlag,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(options.max_line_bytes));

    let (name, welcome) = match &options.prompt {
        Some(prompt) => {
            writer
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write username prompt")?;
            writer.flush().await.context("failed to write username prompt")?;

            let Some(name) = read_username(&mut lines, peer, closer).await else {
                return Ok(());
            };
            activity.mark();
            let welcome = format!("Joining as {name}");
            (name, welcome)
        }
        None => (peer.to_string(), format!("You are {peer}")),
    };

    let (outbound, queue) = mpsc::channel(options.outbound_capacity.max(1));
    let writer_task = tokio::spawn(outbound::run(writer, queue, closer.clone()));

    outbound
        .send(Line::from(welcome))
        .await
        .context("outbound writer stopped before welcome")?;

    let client = Client::new(hub.next_client_id(), name.as_str(), outbound, closer.clone());
    let client_id = client.id();

    // Announce before registering so the newcomer never sees its own arrival.
    hub.submit_message(format!("{name} joined")).await?;
    hub.submit_join(client).await?;
    info!(%peer, %name, client_id, "client joined");

    relay_lines(&mut lines, hub, client_id, &name, closer, activity).await?;

    // Aborts a write the peer will never read, so the writer can see the
    // queue close once the hub drops the client.
    closer.cancel();

    hub.submit_leave(client_id).await?;
    hub.submit_message(format!("{name} is leaving")).await?;
    info!(%peer, %name, client_id, "client left");

    drop(lines);
    if let Err(error) = writer_task.await {
        debug!(?error, client_id, "outbound writer task failed");
    }

    Ok(())
}

async fn read_username<S>(
    lines: &mut Lines<S>,
    peer: &str,
    closer: &CancellationToken,
) -> Option<String>
where
    S: AsyncRead,
{
    match next_line(lines, closer).await {
        Some(Ok(name)) => Some(name),
        Some(Err(error)) => {
            debug!(%peer, ?error, "failed to read username");
            None
        }
        None => {
            debug!(%peer, "connection closed before handshake");
            None
        }
    }
}

async fn relay_lines<S>(
    lines: &mut Lines<S>,
    hub: &HubHandle,
    client_id: ClientId,
    name: &str,
    closer: &CancellationToken,
    activity: &ActivityFlag,
) -> Result<()>
where
    S: AsyncRead,
{
    loop {
        match next_line(lines, closer).await {
            Some(Ok(line)) => {
                hub.submit_message_from(client_id, format!("{name}: {line}"))
                    .await?;
                activity.mark();
            }
            Some(Err(error)) => {
                debug!(%name, ?error, "inbound read failed");
                return Ok(());
            }
            None => return Ok(()),
        }
    }
}

/// Next inbound line, or `None` once the stream ends or the connection is
/// force-closed.
async fn next_line<S>(
    lines: &mut Lines<S>,
    closer: &CancellationToken,
) -> Option<Result<String, LinesCodecError>>
where
    S: AsyncRead,
{
    select! {
        biased;
        _ = closer.cancelled() => None,
        line = lines.next() => line,
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;
    use crate::{config::HubOptions, hub::Hub};

    const WAIT: Duration = Duration::from_secs(1);

    fn spawn_session(
        hub: &HubHandle,
        options: SessionOptions,
    ) -> (DuplexStream, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(run(
            server,
            "127.0.0.1:40000".to_string(),
            hub.clone(),
            Arc::new(options),
        ));
        (client, session)
    }

    async fn read_prompt(conn: &mut BufReader<DuplexStream>) -> String {
        let mut prompt = vec![0; "Chat username: ".len()];
        timeout(WAIT, conn.read_exact(&mut prompt))
            .await
            .expect("timed out waiting for prompt")
            .expect("read prompt");
        String::from_utf8(prompt).expect("utf-8 prompt")
    }

    async fn read_line(conn: &mut BufReader<DuplexStream>) -> Option<String> {
        let mut line = String::new();
        let bytes = timeout(WAIT, conn.read_line(&mut line))
            .await
            .expect("timed out waiting for line")
            .expect("read line");
        (bytes > 0).then(|| line.trim_end_matches('\n').to_string())
    }

    async fn wait_for_roster(hub: &HubHandle, expected: &[&str]) {
        timeout(WAIT, async {
            while hub.roster().await.unwrap() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for roster");
    }

    async fn join_as(hub: &HubHandle, name: &str) -> BufReader<DuplexStream> {
        let (conn, _session) = spawn_session(hub, SessionOptions::default());
        let mut conn = BufReader::new(conn);
        assert_eq!(read_prompt(&mut conn).await, "Chat username: ");
        conn.get_mut()
            .write_all(format!("{name}\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(read_line(&mut conn).await, Some(format!("Joining as {name}")));
        conn
    }

    #[tokio::test]
    async fn handshake_welcomes_privately_then_registers() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let mut alice = join_as(&hub, "alice").await;
        wait_for_roster(&hub, &["alice"]).await;

        let mut bob = join_as(&hub, "bob").await;
        wait_for_roster(&hub, &["alice", "bob"]).await;
        assert_eq!(read_line(&mut alice).await.as_deref(), Some("bob joined"));

        bob.get_mut().write_all(b"hello\n").await.unwrap();
        alice.get_mut().write_all(b"hi bob\n").await.unwrap();
        assert_eq!(read_line(&mut alice).await.as_deref(), Some("bob: hello"));
        // Neither the join announcement nor bob's own line is echoed to bob.
        assert_eq!(read_line(&mut bob).await.as_deref(), Some("alice: hi bob"));
    }

    #[tokio::test]
    async fn anonymous_sessions_use_the_peer_address() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let options = SessionOptions {
            prompt: None,
            ..SessionOptions::default()
        };
        let (conn, _session) = spawn_session(&hub, options);
        let mut conn = BufReader::new(conn);

        assert_eq!(
            read_line(&mut conn).await.as_deref(),
            Some("You are 127.0.0.1:40000")
        );
        wait_for_roster(&hub, &["127.0.0.1:40000"]).await;
    }

    #[tokio::test]
    async fn end_of_stream_unregisters_and_closes_connection() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let (conn, session) = spawn_session(&hub, SessionOptions::default());
        let mut conn = BufReader::new(conn);

        read_prompt(&mut conn).await;
        conn.get_mut().write_all(b"alice\n").await.unwrap();
        read_line(&mut conn).await;
        conn.get_mut().shutdown().await.unwrap();

        timeout(WAIT, session)
            .await
            .expect("session should end")
            .unwrap()
            .unwrap();
        assert!(hub.roster().await.unwrap().is_empty());
        assert_eq!(read_line(&mut conn).await, None);
    }

    #[tokio::test]
    async fn eof_before_username_never_joins() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let (conn, session) = spawn_session(&hub, SessionOptions::default());
        let mut conn = BufReader::new(conn);

        read_prompt(&mut conn).await;
        drop(conn);

        timeout(WAIT, session)
            .await
            .expect("session should end")
            .unwrap()
            .unwrap();
        assert!(hub.roster().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_line_ends_the_session() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let options = SessionOptions {
            max_line_bytes: 16,
            ..SessionOptions::default()
        };
        let (conn, session) = spawn_session(&hub, options);
        let mut conn = BufReader::new(conn);

        read_prompt(&mut conn).await;
        conn.get_mut().write_all(b"alice\n").await.unwrap();
        read_line(&mut conn).await;
        conn.get_mut()
            .write_all(b"this line is far longer than sixteen bytes\n")
            .await
            .unwrap();

        timeout(WAIT, session)
            .await
            .expect("session should end")
            .unwrap()
            .unwrap();
        assert!(hub.roster().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn half_closed_peer_that_stopped_reading_still_ends_the_session() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let (conn, server) = tokio::io::duplex(64);
        let session = tokio::spawn(run(
            server,
            "127.0.0.1:40000".to_string(),
            hub.clone(),
            Arc::new(SessionOptions::default()),
        ));
        let mut conn = BufReader::new(conn);

        read_prompt(&mut conn).await;
        conn.get_mut().write_all(b"alice\n").await.unwrap();
        wait_for_roster(&hub, &["alice"]).await;

        // Never read: the welcome plus this line overflow the pipe.
        hub.submit_message("x".repeat(200)).await.unwrap();
        conn.get_mut().shutdown().await.unwrap();

        timeout(WAIT, session)
            .await
            .expect("session should end after end of stream")
            .unwrap()
            .unwrap();
        assert!(hub.roster().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_ends_the_session() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let (conn, session) = spawn_session(&hub, SessionOptions::default());
        let mut conn = BufReader::new(conn);

        read_prompt(&mut conn).await;
        conn.get_mut().write_all(b"alice\n").await.unwrap();
        read_line(&mut conn).await;
        wait_for_roster(&hub, &["alice"]).await;
        conn.get_mut().write_all(b"\xff\xfe\n").await.unwrap();

        timeout(WAIT, session)
            .await
            .expect("session should end")
            .unwrap()
            .unwrap();
        assert!(hub.roster().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trailing_carriage_return_is_stripped() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let mut alice = join_as(&hub, "alice").await;
        wait_for_roster(&hub, &["alice"]).await;
        let mut bob = join_as(&hub, "bob").await;
        wait_for_roster(&hub, &["alice", "bob"]).await;
        assert_eq!(read_line(&mut alice).await.as_deref(), Some("bob joined"));

        alice.get_mut().write_all(b"hi\r\n").await.unwrap();
        assert_eq!(read_line(&mut bob).await.as_deref(), Some("alice: hi"));
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let options = SessionOptions {
            idle_timeout: Some(Duration::from_millis(50)),
            ..SessionOptions::default()
        };
        let (conn, session) = spawn_session(&hub, options);
        let mut conn = BufReader::new(conn);

        read_prompt(&mut conn).await;
        timeout(WAIT, session)
            .await
            .expect("idle session should end")
            .unwrap()
            .unwrap();
        assert_eq!(read_line(&mut conn).await, None);
    }
}
