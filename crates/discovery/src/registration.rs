//! Publishing a local master over DNS-SD.
//!
//! One registration exists per advertised socket address. Updates are
//! applied in place where the responder allows it (TXT-only changes);
//! anything that alters the instance name, port, or scope subtype is a
//! cancel-and-republish. A name collision cancels the registration and
//! is reported; the instance name is never changed behind the caller's
//! back, since the election and connection layers key off it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use e133_protocol::constants::{MASTER_SERVICE, scope_subtype};
use e133_protocol::{MasterEntry, TxtRecord, master_txt};
use e133_responder::{ClientState, OpHandle, Responder, ServiceRegistration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistrationState {
    Unpublished,
    Publishing,
    Published,
    Collided,
}

/// What the live handle currently advertises.
struct PublishedShape {
    instance: String,
    scope: String,
    port: u16,
    txt: TxtRecord,
}

pub(crate) struct MasterRegistration {
    responder: Arc<dyn Responder>,
    /// Desired state; survives responder outages for republication.
    entry: Option<MasterEntry>,
    handle: Option<OpHandle>,
    state: RegistrationState,
    published: Option<PublishedShape>,
}

impl MasterRegistration {
    pub(crate) fn new(responder: Arc<dyn Responder>) -> Self {
        Self {
            responder,
            entry: None,
            handle: None,
            state: RegistrationState::Unpublished,
            published: None,
        }
    }

    pub(crate) fn handle(&self) -> Option<OpHandle> {
        self.handle
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RegistrationState {
        self.state
    }

    /// Publishes `master`, or applies the difference to an existing
    /// registration.
    pub(crate) fn register_or_update(&mut self, master: MasterEntry) {
        if self.entry.as_ref() == Some(&master) {
            return;
        }

        if self.responder.state() != ClientState::Running {
            debug!(master = %master, "responder not running; buffering registration");
            self.entry = Some(master);
            return;
        }

        if self.state == RegistrationState::Published {
            let txt = master_txt(&master);
            let in_place = self.published.as_ref().is_some_and(|shape| {
                shape.instance == master.service_name()
                    && shape.scope == master.scope
                    && shape.port == master.address.port()
            });
            if in_place {
                // Only the TXT contents changed.
                if let (Some(handle), Some(shape)) = (self.handle, self.published.as_mut()) {
                    if shape.txt != txt {
                        match self.responder.update_txt(handle, &txt) {
                            Ok(()) => shape.txt = txt,
                            Err(e) => warn!(master = %master, "TXT update failed: {e}"),
                        }
                    }
                }
                self.entry = Some(master);
                return;
            }
        }

        // Name, port, or scope changed: tear down and publish fresh with
        // the new subtype.
        self.cancel();
        self.entry = Some(master);
        self.publish();
    }

    pub(crate) fn on_registered(&mut self) {
        if self.state == RegistrationState::Publishing {
            info!(master = ?self.entry.as_ref().map(|e| e.service_name()), "master registered");
            self.state = RegistrationState::Published;
        }
    }

    pub(crate) fn on_collision(&mut self) {
        warn!(
            master = ?self.entry.as_ref().map(|e| e.service_name()),
            "service name collision; registration cancelled, not renaming"
        );
        self.cancel();
        self.state = RegistrationState::Collided;
    }

    pub(crate) fn on_registration_failed(&mut self) {
        warn!(
            master = ?self.entry.as_ref().map(|e| e.service_name()),
            "registration failed"
        );
        self.cancel();
        self.state = RegistrationState::Unpublished;
    }

    /// The responder came (back) up; publish whatever is buffered.
    pub(crate) fn on_responder_running(&mut self) {
        self.handle = None;
        self.published = None;
        self.state = RegistrationState::Unpublished;
        if self.entry.is_some() {
            self.publish();
        }
    }

    /// The responder went away; every handle is now stale.
    pub(crate) fn on_responder_lost(&mut self) {
        self.cancel();
        self.state = RegistrationState::Unpublished;
    }

    /// Final teardown on deregister or agent shutdown.
    pub(crate) fn close(&mut self) {
        self.cancel();
        self.state = RegistrationState::Unpublished;
        self.entry = None;
    }

    fn publish(&mut self) {
        let Some(master) = self.entry.clone() else {
            return;
        };

        let subtype = (!master.scope.is_empty()).then(|| scope_subtype(&master.scope));
        let addresses = if master.has_concrete_address() {
            vec![*master.address.ip()]
        } else {
            Vec::new()
        };
        let txt = master_txt(&master);
        let registration = ServiceRegistration {
            name: master.service_name(),
            service_type: MASTER_SERVICE.to_string(),
            subtype,
            port: master.address.port(),
            addresses,
            txt: txt.clone(),
        };

        match self.responder.start_register(&registration) {
            Ok(handle) => {
                info!(master = %master, "publishing master");
                self.handle = Some(handle);
                self.state = RegistrationState::Publishing;
                self.published = Some(PublishedShape {
                    instance: registration.name,
                    scope: master.scope.clone(),
                    port: registration.port,
                    txt,
                });
            }
            Err(e) => {
                warn!(master = %master, "failed to start registration: {e}");
                self.state = RegistrationState::Unpublished;
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.responder.close(handle);
        }
        self.published = None;
    }
}
