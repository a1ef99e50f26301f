//! Shared helpers for the integration suites.

use std::sync::Arc;

use tokio::sync::mpsc;

use skein_xmpp::config::ServerConfig;
use skein_xmpp::protocol::SessionStateMachine;
use skein_xmpp::session::{SessionWriter, WriterCommand};
use skein_xmpp::storage::{MemoryAccounts, MemoryOfflineStore, MemoryRoster};
use skein_xmpp::ServerRuntimeContext;

/// Stream header a client sends to skein.im.
pub const CLIENT_HEADER: &str = "<?xml version='1.0'?>\
    <stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' \
    to='skein.im' version='1.0'>";

/// Install a test subscriber once.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// A runtime over in-memory storage with two known accounts.
pub fn test_runtime(config: ServerConfig) -> Arc<ServerRuntimeContext> {
    let accounts = Arc::new(MemoryAccounts::with_users(&[
        ("user1@skein.im", "password1"),
        ("user2@skein.im", "password2"),
    ]));
    ServerRuntimeContext::new(
        config,
        accounts,
        Arc::new(MemoryRoster::new()),
        Arc::new(MemoryOfflineStore::new()),
    )
    .expect("test runtime must build")
}

/// A state machine plus the receiving end of its writer lane.
pub fn machine(
    runtime: &Arc<ServerRuntimeContext>,
) -> (SessionStateMachine, mpsc::Receiver<WriterCommand>) {
    let (writer, rx) = SessionWriter::channel();
    (SessionStateMachine::new(Arc::clone(runtime), writer), rx)
}

/// Render everything currently queued on a writer lane.
pub fn drain_writer(rx: &mut mpsc::Receiver<WriterCommand>) -> String {
    let mut out = String::new();
    while let Ok(command) = rx.try_recv() {
        match command {
            WriterCommand::Raw(xml) => out.push_str(&xml),
            WriterCommand::Stanza(stanza) => out.push_str(&stanza.render()),
            WriterCommand::Close => out.push_str("</stream:stream>"),
        }
    }
    out
}
