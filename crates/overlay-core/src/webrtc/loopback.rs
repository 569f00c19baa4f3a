//! In-memory WebRTC engine.
//!
//! Descriptions are opaque tokens; answering an offer links the two peers
//! directly and data is handed from one event channel to the other. Clone
//! the engine to share it between nodes of the same test.

use super::{DescriptionKind, RtcPeer, RtcPeerEvent, WebrtcEngine};
use crate::peer_descriptor::PeerDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

type OfferTable = Arc<Mutex<HashMap<String, Weak<LoopbackPeer>>>>;

#[derive(Clone, Default)]
pub struct LoopbackWebrtcEngine {
    offers: OfferTable,
}

impl LoopbackWebrtcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers created but not yet answered.
    pub fn open_offers(&self) -> usize {
        self.offers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl WebrtcEngine for LoopbackWebrtcEngine {
    fn create_peer(&self, local: &PeerDescriptor, remote: &PeerDescriptor) -> Arc<dyn RtcPeer> {
        let (tx, rx) = mpsc::unbounded_channel();
        let offers = self.offers.clone();
        let label = format!("{}->{}", local.label(), remote.label());
        Arc::new_cyclic(|me| LoopbackPeer {
            offers,
            me: me.clone(),
            label,
            tx,
            rx: Mutex::new(Some(rx)),
            state: Mutex::new(PeerState::default()),
        })
    }
}

#[derive(Default)]
struct PeerState {
    token: Option<String>,
    partner: Option<Weak<LoopbackPeer>>,
    open: bool,
    closed: bool,
}

struct LoopbackPeer {
    offers: OfferTable,
    me: Weak<LoopbackPeer>,
    label: String,
    tx: mpsc::UnboundedSender<RtcPeerEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RtcPeerEvent>>>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    fn emit(&self, event: RtcPeerEvent) {
        let _ = self.tx.send(event);
    }

    fn announce(&self, kind: DescriptionKind, token: String) {
        self.lock().token = Some(token.clone());
        self.emit(RtcPeerEvent::LocalDescription(kind, token.clone()));
        self.emit(RtcPeerEvent::LocalCandidate {
            candidate: format!("candidate:loopback {}", token),
            mid: "0".to_string(),
        });
    }

    fn partner(&self) -> Option<Arc<LoopbackPeer>> {
        self.lock().partner.as_ref().and_then(Weak::upgrade)
    }

    fn open(&self) {
        let mut state = self.lock();
        if state.closed || state.open {
            return;
        }
        state.open = true;
        drop(state);
        self.emit(RtcPeerEvent::Open);
    }

    fn remote_closed(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.open = false;
        drop(state);
        self.emit(RtcPeerEvent::Closed);
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RtcPeer for LoopbackPeer {
    fn start_offer(&self) {
        let token = uuid::Uuid::new_v4().to_string();
        self.offers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.clone(), self.me.clone());
        trace!("{} offered", self.label);
        self.announce(DescriptionKind::Offer, token);
    }

    fn set_remote_description(&self, kind: DescriptionKind, description: &str) {
        if self.lock().closed {
            return;
        }
        match kind {
            DescriptionKind::Offer => {
                let offerer = self
                    .offers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(description)
                    .and_then(|weak| weak.upgrade());
                let Some(offerer) = offerer else {
                    self.emit(RtcPeerEvent::Error(format!("unknown offer {}", description)));
                    return;
                };
                self.lock().partner = Some(Arc::downgrade(&offerer));
                offerer.lock().partner = Some(self.me.clone());
                self.announce(DescriptionKind::Answer, uuid::Uuid::new_v4().to_string());
            }
            DescriptionKind::Answer => {
                let Some(partner) = self.partner() else {
                    debug!("{} got an answer before its offer was taken", self.label);
                    return;
                };
                if partner.lock().token.as_deref() != Some(description) {
                    self.emit(RtcPeerEvent::Error(format!("unexpected answer {}", description)));
                    return;
                }
                self.open();
                partner.open();
            }
        }
    }

    fn add_remote_candidate(&self, candidate: &str, mid: &str) {
        trace!("{} remote candidate {} ({})", self.label, candidate, mid);
    }

    fn send(&self, data: Vec<u8>) {
        if !self.lock().open {
            return;
        }
        if let Some(partner) = self.partner() {
            if partner.lock().open {
                partner.emit(RtcPeerEvent::Data(data));
            }
        }
    }

    fn close(&self) {
        let (token, partner) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            (state.token.take(), state.partner.take())
        };
        if let Some(token) = token {
            self.offers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&token);
        }
        self.emit(RtcPeerEvent::Closed);
        if let Some(partner) = partner.and_then(|weak| weak.upgrade()) {
            partner.remote_closed();
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcPeerEvent>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
