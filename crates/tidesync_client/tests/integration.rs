//! End-to-end tests driving the engine against a scripted mock server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_client::{
    ClientConfig, ConnectionState, ErrorCode, FreshCopyDownloader, MemoryHistory,
    MockSocketProvider, SessionConfig, SessionState, StopPolicy, SyncClient, SyncError,
    SyncResult, SyncSession, SyncMode,
};
use tidesync_protocol::{
    ClientMessage, Download, DownloadCursor, ErrorInfo, ErrorMessage, IdentAllocation,
    MarkResponse, ProtocolErrorCode, RecoveryAction, SaltedFileIdent, SaltedVersion,
    ServerMessage, SyncProgress, UploadChangeset, UploadCursor,
};
use tokio::sync::{mpsc, oneshot};

struct TestRig {
    provider: Arc<MockSocketProvider>,
    client: SyncClient,
    history: Arc<MemoryHistory>,
}

fn rig() -> TestRig {
    let provider = Arc::new(MockSocketProvider::new());
    let client =
        SyncClient::with_socket_provider(ClientConfig::default(), Arc::clone(&provider) as _);
    TestRig {
        provider,
        client,
        history: Arc::new(MemoryHistory::new()),
    }
}

fn session_config(stop_policy: StopPolicy) -> SessionConfig {
    SessionConfig::new(
        "tidesync://server.test/data",
        "/stores/app.store",
        SyncMode::Partition("/default".into()),
    )
    .with_stop_policy(stop_policy)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn file_ident() -> SaltedFileIdent {
    SaltedFileIdent { ident: 9, salt: 44 }
}

fn ack_progress(server_version: u64, client_version: u64) -> SyncProgress {
    SyncProgress {
        latest_server_version: SaltedVersion {
            version: server_version,
            salt: 1,
        },
        download: DownloadCursor {
            server_version,
            last_integrated_client_version: client_version,
        },
        upload: UploadCursor {
            client_version,
            last_integrated_server_version: 0,
        },
    }
}

/// Accepts the connection and answers the BIND/IDENT handshake. Returns
/// the server socket and the session identifier the client chose.
async fn accept_and_bind(provider: &MockSocketProvider) -> (tidesync_client::MockServerSocket, u64)
{
    let mut server = provider.accept().await;
    let bind = match server.recv_message().await.expect("bind") {
        ClientMessage::Bind(bind) => bind,
        other => panic!("expected BIND, got {other:?}"),
    };
    let session_ident = bind.session_ident;
    if bind.need_file_ident {
        server.send_message(&ServerMessage::Ident(IdentAllocation {
            session_ident,
            file_ident: file_ident(),
        }));
    }
    match server.recv_message().await.expect("ident") {
        ClientMessage::Ident(_) => {}
        other => panic!("expected IDENT, got {other:?}"),
    }
    (server, session_ident)
}

#[tokio::test(start_paused = true)]
async fn full_sync_cycle_with_completions() {
    let rig = rig();
    rig.history.add_local_changeset(UploadChangeset {
        client_version: 1,
        last_integrated_server_version: 0,
        origin_timestamp: 0,
        origin_file_ident: 0,
        payload: vec![1, 2, 3],
    });

    let session = SyncSession::builder(
        &rig.client,
        session_config(StopPolicy::Immediate),
        Arc::clone(&rig.history) as _,
    )
    .build()
    .unwrap();
    session.revive_if_needed();
    assert_eq!(session.state(), SessionState::Active);

    let (download_done_tx, download_done_rx) = oneshot::channel::<SyncResult<()>>();
    let (upload_done_tx, upload_done_rx) = oneshot::channel::<SyncResult<()>>();
    session.wait_for_download_completion(move |result| {
        let _ = download_done_tx.send(result);
    });
    session.wait_for_upload_completion(move |result| {
        let _ = upload_done_tx.send(result);
    });

    let (mut server, session_ident) = accept_and_bind(&rig.provider).await;

    // The download checkpoint request arrives as a MARK.
    let mark = match server.recv_message().await.expect("mark") {
        ClientMessage::Mark(mark) => mark,
        other => panic!("expected MARK, got {other:?}"),
    };
    server.send_message(&ServerMessage::Mark(MarkResponse {
        session_ident,
        request_ident: mark.request_ident,
    }));
    assert!(download_done_rx.await.unwrap().is_ok());

    // Download completion lifts the upload hold; the local changeset
    // goes out.
    let upload = match server.recv_message().await.expect("upload") {
        ClientMessage::Upload(upload) => upload,
        other => panic!("expected UPLOAD, got {other:?}"),
    };
    assert_eq!(upload.changesets.len(), 1);
    assert_eq!(upload.changesets[0].client_version, 1);

    // The server acknowledges the upload through DOWNLOAD progress.
    server.send_message(&ServerMessage::Download(Download {
        session_ident,
        progress: ack_progress(1, 1),
        downloadable_bytes: 0,
        last_in_batch: true,
        query_version: 0,
        changesets: vec![],
    }));
    assert!(upload_done_rx.await.unwrap().is_ok());

    wait_for(|| session.connection_state() == ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn fatal_error_tears_down_and_reports_once() {
    let rig = rig();
    let session = SyncSession::builder(
        &rig.client,
        session_config(StopPolicy::Immediate),
        Arc::clone(&rig.history) as _,
    )
    .build()
    .unwrap();

    let error_count = Arc::new(AtomicUsize::new(0));
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<SyncError>();
    {
        let error_count = Arc::clone(&error_count);
        session.set_error_handler(move |error| {
            error_count.fetch_add(1, Ordering::SeqCst);
            let _ = error_tx.send(error);
        });
    }

    session.revive_if_needed();
    let (cancelled_tx, cancelled_rx) = oneshot::channel::<SyncResult<()>>();
    session.wait_for_upload_completion(move |result| {
        let _ = cancelled_tx.send(result);
    });

    let (mut server, session_ident) = accept_and_bind(&rig.provider).await;

    let mut info = ErrorInfo::new("application bug detected");
    info.action = RecoveryAction::ApplicationBug;
    server.send_message(&ServerMessage::Error(ErrorMessage {
        session_ident,
        code: ProtocolErrorCode::OtherSessionError.as_raw(),
        info,
    }));

    wait_for(|| session.state() == SessionState::Inactive).await;

    // Pending completion waits resolve with the cancellation status.
    let cancellation = cancelled_rx.await.unwrap();
    assert!(cancellation.is_err());

    // The error handler ran exactly once, with the original error code.
    let reported = error_rx.recv().await.unwrap();
    assert_eq!(
        reported.code,
        ErrorCode::Protocol(ProtocolErrorCode::OtherSessionError)
    );
    assert!(reported.is_fatal());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(error_count.load(Ordering::SeqCst), 1);

    // The session said goodbye with an UNBIND.
    let unbind = server.recv_message().await.expect("unbind");
    assert!(matches!(unbind, ClientMessage::Unbind(_)));
}

#[tokio::test(start_paused = true)]
async fn dying_session_waits_for_upload_drain() {
    let rig = rig();
    rig.history.add_local_changeset(UploadChangeset {
        client_version: 1,
        last_integrated_server_version: 0,
        origin_timestamp: 0,
        origin_file_ident: 0,
        payload: vec![7],
    });

    let session = SyncSession::builder(
        &rig.client,
        session_config(StopPolicy::AfterChangesUploaded),
        Arc::clone(&rig.history) as _,
    )
    .build()
    .unwrap();
    session.revive_if_needed();

    let (mut server, session_ident) = accept_and_bind(&rig.provider).await;

    // Drive download completion so uploads activate.
    let (done_tx, done_rx) = oneshot::channel::<SyncResult<()>>();
    session.wait_for_download_completion(move |result| {
        let _ = done_tx.send(result);
    });
    let mark = match server.recv_message().await.expect("mark") {
        ClientMessage::Mark(mark) => mark,
        other => panic!("expected MARK, got {other:?}"),
    };
    server.send_message(&ServerMessage::Mark(MarkResponse {
        session_ident,
        request_ident: mark.request_ident,
    }));
    done_rx.await.unwrap().unwrap();

    let upload = server.recv_message().await.expect("upload");
    assert!(matches!(upload, ClientMessage::Upload(_)));

    // Close while the server has not acknowledged: the session dies
    // slowly, draining uploads.
    session.close();
    assert_eq!(session.state(), SessionState::Dying);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(session.state(), SessionState::Dying);

    // The acknowledgement arrives; the session can finally rest.
    server.send_message(&ServerMessage::Download(Download {
        session_ident,
        progress: ack_progress(1, 1),
        downloadable_bytes: 0,
        last_in_batch: true,
        query_version: 0,
        changesets: vec![],
    }));
    wait_for(|| session.state() == SessionState::Inactive).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_connection_drop() {
    let rig = rig();
    let session = SyncSession::builder(
        &rig.client,
        session_config(StopPolicy::Immediate),
        Arc::clone(&rig.history) as _,
    )
    .build()
    .unwrap();
    session.revive_if_needed();

    let (server, _) = accept_and_bind(&rig.provider).await;
    wait_for(|| session.connection_state() == ConnectionState::Connected).await;

    // The server goes away; the client reconnects with backoff and
    // rebinds, now with a known file identity.
    drop(server);
    let mut server = rig.provider.accept().await;
    let bind = match server.recv_message().await.expect("rebind") {
        ClientMessage::Bind(bind) => bind,
        other => panic!("expected BIND, got {other:?}"),
    };
    assert!(!bind.need_file_ident);
    assert!(session.state() == SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn state_transition_table() {
    let rig = rig();
    let session = SyncSession::builder(
        &rig.client,
        session_config(StopPolicy::Immediate),
        Arc::clone(&rig.history) as _,
    )
    .build()
    .unwrap();

    assert_eq!(session.state(), SessionState::Inactive);

    session.pause();
    assert_eq!(session.state(), SessionState::Paused);

    // Revival is a no-op while paused.
    session.revive_if_needed();
    assert_eq!(session.state(), SessionState::Paused);

    session.resume();
    assert_eq!(session.state(), SessionState::Active);

    session.pause();
    assert_eq!(session.state(), SessionState::Paused);
    session.resume();
    assert_eq!(session.state(), SessionState::Active);

    // Immediate stop policy: close goes straight to Inactive.
    session.close();
    assert_eq!(session.state(), SessionState::Inactive);

    session.resume();
    assert_eq!(session.state(), SessionState::Active);
    session.force_close();
    assert_eq!(session.state(), SessionState::Inactive);

    // Closing an inactive session stays inactive and unregisters it.
    session.close();
    assert_eq!(session.state(), SessionState::Inactive);
    assert!(!rig.client.has_session("/stores/app.store"));
}

struct RecordingDownloader {
    actions: parking_lot::Mutex<Vec<RecoveryAction>>,
}

#[async_trait::async_trait]
impl FreshCopyDownloader for RecordingDownloader {
    async fn download_fresh_copy(&self, action: RecoveryAction) -> SyncResult<()> {
        self.actions.lock().push(action);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn client_reset_downloads_fresh_copy_and_restarts() {
    let rig = rig();
    let downloader = Arc::new(RecordingDownloader {
        actions: parking_lot::Mutex::new(Vec::new()),
    });
    let session = SyncSession::builder(
        &rig.client,
        session_config(StopPolicy::Immediate),
        Arc::clone(&rig.history) as _,
    )
    .with_fresh_copy_downloader(Arc::clone(&downloader) as _)
    .build()
    .unwrap();

    let error_count = Arc::new(AtomicUsize::new(0));
    {
        let error_count = Arc::clone(&error_count);
        session.set_error_handler(move |_| {
            error_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    session.revive_if_needed();
    let (mut server, session_ident) = accept_and_bind(&rig.provider).await;

    let mut info = ErrorInfo::new("client file ident is bad");
    info.action = RecoveryAction::ClientReset;
    server.send_message(&ServerMessage::Error(ErrorMessage {
        session_ident,
        code: ProtocolErrorCode::BadClientFileIdent.as_raw(),
        info,
    }));

    // The reset flow runs and the session restarts: the old session
    // unbinds and a new one binds on the same connection.
    let mut saw_new_bind = false;
    for _ in 0..4 {
        match server.recv_message().await {
            Some(ClientMessage::Unbind(_)) => {}
            Some(ClientMessage::Bind(bind)) => {
                assert_ne!(bind.session_ident, session_ident);
                saw_new_bind = true;
                break;
            }
            Some(ClientMessage::Ident(_)) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert!(saw_new_bind);
    assert_eq!(*downloader.actions.lock(), vec![RecoveryAction::ClientReset]);
    // The reset path reports through its own flow, not the error handler.
    assert_eq!(error_count.load(Ordering::SeqCst), 0);
    assert_eq!(session.state(), SessionState::Active);
}
