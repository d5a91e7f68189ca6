use std::future::Future;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::auth::auth_verifier::unix_now;
use crate::realm::credentials::{CredentialFetcher, CredentialResult};
use crate::realm::realm_dispatcher::RealmDispatcher;
use crate::util::random::Random;

pub const MAX_RECV_LEN: usize = 64 * 1024;

/// The server's event loop: received packets, retransmission timers, credential fetches
///  completing in the background, and the periodic sweep of expired session keys are all
///  handled here, one at a time. The loop terminates when `shutdown` completes.
pub async fn run_server<R: Random>(
    socket: Arc<UdpSocket>,
    mut dispatcher: RealmDispatcher<R>,
    fetcher: Arc<dyn CredentialFetcher>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let (credential_sender, mut credential_receiver) = mpsc::channel::<CredentialResult>(16);

    let sweep_interval = dispatcher.config().auth.sweep_interval;
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);

    let mut buf = vec![0u8; MAX_RECV_LEN];
    tokio::pin!(shutdown);

    info!(addr=?socket.local_addr()?, realm=%dispatcher.config().realm, "starting server");
    // sends never wait, so the socket must be known to be writable before announcing
    socket.writable().await?;
    dispatcher.announce_boot(Instant::now());

    loop {
        spawn_credential_fetches(&mut dispatcher, &fetcher, &credential_sender);
        let deadline = dispatcher.next_deadline();

        select! {
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, from)) => dispatcher.handle_packet(&buf[..len], from, Instant::now()),
                    Err(e) => warn!("error receiving from socket: {}", e),
                }
            }
            _ = sleep_until_deadline(deadline) => {
                dispatcher.tick(Instant::now());
            }
            Some(result) = credential_receiver.recv() => {
                dispatcher.on_credentials(result, Instant::now());
            }
            _ = sweep.tick() => {
                dispatcher.sweep(unix_now());
            }
            _ = &mut shutdown => {
                info!("shutting down server");
                dispatcher.announce_shutdown(None);
                break;
            }
        }
    }
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Fetching credentials can take long, so it runs in separate tasks that post their result back
///  into the loop
fn spawn_credential_fetches<R: Random>(dispatcher: &mut RealmDispatcher<R>, fetcher: &Arc<dyn CredentialFetcher>, results: &mpsc::Sender<CredentialResult>) {
    for realm in dispatcher.take_credential_requests() {
        debug!(realm, "fetching credentials in the background");
        let fetcher = fetcher.clone();
        let results = results.clone();
        tokio::spawn(async move {
            let credential = fetcher.fetch(&realm).await;
            if results.send(CredentialResult { realm, credential }).await.is_err() {
                debug!("server loop terminated - discarding credentials");
            }
        });
    }
}
