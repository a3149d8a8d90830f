use tether_proto::PeerEnvelope;
use tracing::debug;

use crate::metrics;
use crate::registry::{ConnectionId, Delivery, SessionRegistry};

/// Forward a peer envelope from `device_id` (speaking on `connection`) to its
/// partner. Unknown, superseded and unpaired senders are dropped, as are
/// kinds the sender's role may not originate.
pub fn route(
    registry: &SessionRegistry,
    device_id: &str,
    connection: ConnectionId,
    envelope: PeerEnvelope,
) -> Option<Delivery> {
    let kind = envelope.kind();
    let Some(sender) = registry.endpoint(device_id) else {
        debug!(device = %device_id, kind, "route from unknown device");
        metrics::DROPPED.with_label_values(&["unknown_sender"]).inc();
        return None;
    };
    if sender.connection != connection {
        debug!(device = %device_id, connection, kind, "route from superseded connection");
        metrics::DROPPED.with_label_values(&["stale_connection"]).inc();
        return None;
    }
    let Some(partner_id) = sender.paired_with.as_deref() else {
        debug!(device = %device_id, kind, "route from unpaired device");
        metrics::DROPPED.with_label_values(&["unpaired"]).inc();
        return None;
    };
    if let Some(origin) = envelope.origin() {
        if origin != sender.role {
            debug!(device = %device_id, role = %sender.role, kind, "wrong direction");
            metrics::DROPPED.with_label_values(&["direction"]).inc();
            return None;
        }
    }
    let partner = registry.endpoint(partner_id)?;

    metrics::ROUTED.with_label_values(&[kind]).inc();
    Some(Delivery {
        connection: partner.connection,
        envelope: envelope.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Credential, RegistryOptions};
    use std::time::Instant;
    use tether_proto::{Role, SessionDescription};

    fn paired_registry() -> SessionRegistry {
        let now = Instant::now();
        let mut registry = SessionRegistry::new(RegistryOptions {
            debug_code: true,
            ..RegistryOptions::default()
        });
        registry.register(1, "host-a", Role::Host, Credential::Absent, now);
        registry.register(2, "viewer-a", Role::Viewer, Credential::Absent, now);
        registry.register(3, "viewer-b", Role::Viewer, Credential::Absent, now);
        registry
            .redeem("viewer-a", "0000", None, now)
            .expect("redeem debug code");
        registry
    }

    #[test_timeout::timeout]
    fn delivers_only_to_current_partner() {
        let registry = paired_registry();
        let offer = PeerEnvelope::Offer {
            description: SessionDescription::offer("v=0"),
        };
        let delivery = route(&registry, "host-a", 1, offer.clone()).expect("routed");
        assert_eq!(delivery.connection, 2);
        assert_eq!(delivery.envelope, tether_proto::ServerEnvelope::from(offer));

        let input = PeerEnvelope::TerminalInput { data: b"ls\n".to_vec() };
        assert_eq!(route(&registry, "viewer-a", 2, input).unwrap().connection, 1);
    }

    #[test_timeout::timeout]
    fn unpaired_or_unknown_sender_is_a_no_op() {
        let registry = paired_registry();
        let ready = PeerEnvelope::system("terminal_ready");
        assert!(route(&registry, "viewer-b", 3, ready.clone()).is_none());
        assert!(route(&registry, "nobody", 9, ready).is_none());
    }

    #[test_timeout::timeout]
    fn stale_connection_cannot_speak_for_device() {
        let registry = paired_registry();
        let output = PeerEnvelope::TerminalOutput { data: b"x".to_vec() };
        assert!(route(&registry, "host-a", 42, output).is_none());
    }

    #[test_timeout::timeout]
    fn direction_filter_drops_wrong_role() {
        let registry = paired_registry();
        let answer = PeerEnvelope::Answer {
            description: SessionDescription::answer("v=0"),
        };
        assert!(route(&registry, "host-a", 1, answer).is_none());
        let output = PeerEnvelope::TerminalOutput { data: vec![1] };
        assert!(route(&registry, "viewer-a", 2, output).is_none());

        let resize = PeerEnvelope::TerminalResize { cols: 90, rows: 30 };
        assert!(route(&registry, "viewer-a", 2, resize).is_some());
        let note = PeerEnvelope::system("hello");
        assert!(route(&registry, "host-a", 1, note).is_some());
    }
}
