use std::collections::BTreeSet;
use std::iter::once;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::auth::auth_verifier::{unix_now, AuthVerifier};
use crate::auth::checksum::authenticate;
use crate::auth::ticket::TicketVerifier;
use crate::delivery::delivery_queue::{AckMatch, DeliveryEvent, DeliveryOutcome, DeliveryQueue};
use crate::notice::control::*;
use crate::notice::fragment::{split_body, FragmentRange};
use crate::notice::notice::{body_from_fields, AuthStatus, Notice, NoticeKind};
use crate::notice::uid::UidMinter;
use crate::realm::credentials::{CredentialResult, RealmCredential};
use crate::realm::locations::{Announcement, Exposure, Location, LocationTable};
use crate::realm::realm_config::{server_principal, ServerConfig};
use crate::realm::subscriptions::{Subscriber, SubscriptionKey, SubscriptionTable};
use crate::transport::{send_unreliable, PacketSender};
use crate::util::random::{Random, RngRandom};

/// Where a recipient lives
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Recipient {
    /// the recipient in the form local subscriptions are keyed by
    Local(String),
    Foreign { realm: String, user: String },
}

/// a handoff waiting for credentials for its realm; it is given up at `deadline`
struct ParkedHandoff {
    notice: Notice,
    relay_to: Option<SocketAddr>,
    deadline: Instant,
}

/// Routes every notice arriving at a server: control notices are handled here, ordinary notices
///  go to local subscribers and, depending on recipient and subscriptions, to foreign realms
///  through the delivery queue.
pub struct RealmDispatcher<R: Random = RngRandom> {
    config: Arc<ServerConfig>,
    sender: Arc<dyn PacketSender>,
    queue: DeliveryQueue<R>,
    auth: AuthVerifier,
    subscriptions: SubscriptionTable,
    locations: LocationTable,
    uids: UidMinter,
    credentials: FxHashMap<String, RealmCredential>,
    parked: FxHashMap<String, Vec<ParkedHandoff>>,
    credential_requests: Vec<String>,
    fetching: FxHashSet<String>,
}

impl RealmDispatcher<RngRandom> {
    pub fn new(config: Arc<ServerConfig>, sender: Arc<dyn PacketSender>, tickets: Arc<dyn TicketVerifier>) -> anyhow::Result<RealmDispatcher<RngRandom>> {
        RealmDispatcher::new_with_random(config, sender, tickets)
    }
}

impl<R: Random> RealmDispatcher<R> {
    pub fn new_with_random(config: Arc<ServerConfig>, sender: Arc<dyn PacketSender>, tickets: Arc<dyn TicketVerifier>) -> anyhow::Result<RealmDispatcher<R>> {
        config.validate()?;

        let mut queue = DeliveryQueue::new_with_random(config.delivery.clone(), sender.clone());
        for realm in &config.realms {
            queue.add_peer(&realm.name, realm.servers.clone())?;
        }

        let mut subscriptions = SubscriptionTable::new();
        for s in &config.subscriptions {
            subscriptions.subscribe(SubscriptionKey::new(&s.class, &s.instance, &s.recipient), Subscriber::Client(s.client));
        }

        Ok(RealmDispatcher {
            auth: AuthVerifier::new(config.auth.clone(), tickets),
            uids: UidMinter::new(config.server_addr.ip()),
            config,
            sender,
            queue,
            subscriptions,
            locations: LocationTable::new(),
            credentials: Default::default(),
            parked: Default::default(),
            credential_requests: Vec::new(),
            fetching: Default::default(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn queue(&self) -> &DeliveryQueue<R> {
        &self.queue
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn locations(&self) -> &LocationTable {
        &self.locations
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let parked = self.parked.values()
            .flatten()
            .map(|p| p.deadline)
            .min();
        match (self.queue.next_deadline(), parked) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// the number of handoffs waiting for credentials
    pub fn num_parked(&self) -> usize {
        self.parked.values().map(|p| p.len()).sum()
    }

    /// Decodes and dispatches a received datagram. Malformed packets are logged and dropped.
    pub fn handle_packet(&mut self, packet: &[u8], from: SocketAddr, now: Instant) {
        match Notice::try_deser(packet) {
            Ok(notice) => self.handle_notice(notice, from, now),
            Err(e) => warn!(?from, "dropping malformed packet: {}", e),
        }
    }

    pub fn handle_notice(&mut self, notice: Notice, from: SocketAddr, now: Instant) {
        match self.queue.peers().peer_for_addr(&from).map(|r| r.to_string()) {
            Some(realm) => self.on_realm_notice(&realm, notice, from, now),
            None => self.on_client_notice(notice, from, now),
        }
        self.log_transitions();
    }

    /// retransmission and failover; handoffs that failed terminally are nacked to their sender
    pub fn tick(&mut self, now: Instant) {
        for event in self.queue.tick(now) {
            self.on_delivery_complete(event);
        }
        self.expire_parked(now);
        self.log_transitions();
    }

    /// handoffs whose credentials did not arrive in time are given up and nacked
    fn expire_parked(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (realm, handoffs) in self.parked.iter_mut() {
            let (gone, waiting) = std::mem::take(handoffs)
                .into_iter()
                .partition::<Vec<_>, _>(|p| p.deadline <= now);
            *handoffs = waiting;
            expired.extend(gone.into_iter().map(|p| (realm.clone(), p)));
        }
        self.parked.retain(|_, handoffs| !handoffs.is_empty());
        // a fetch that did not answer in time is requested again by the next handoff
        let parked = &self.parked;
        self.fetching.retain(|realm| parked.contains_key(realm));

        for (realm, p) in expired {
            warn!(realm, uid=?p.notice.uid, "no credentials for realm in time - giving up handoff");
            if let Some(to) = p.relay_to {
                self.nack(&p.notice, to, Some(ACK_LOST));
            }
        }
    }

    fn log_transitions(&mut self) {
        for t in self.queue.take_transitions() {
            info!(realm=%t.peer, from=?t.from, to=?t.to, old_addr=?t.old_addr, new_addr=?t.new_addr, "realm server state changed");
        }
    }

    fn reply(&self, notice: &Notice, to: SocketAddr, kind: NoticeKind, body: Bytes) {
        send_unreliable(self.sender.as_ref(), to, &notice.reply(kind, body));
    }

    fn nack(&self, notice: &Notice, to: SocketAddr, reason: Option<&str>) {
        let body = reason.map(|r| body_from_fields(&[r])).unwrap_or_default();
        self.reply(notice, to, NoticeKind::ServNak, body);
    }

    /// the server's ack for a client notice it took responsibility for
    fn ack_client(&self, notice: &Notice, to: SocketAddr) {
        if matches!(notice.kind, NoticeKind::Acked | NoticeKind::Unacked) {
            self.reply(notice, to, NoticeKind::ServAck, body_from_fields(&[ACK_SENT]));
        }
    }

    //------------------------------ recipients

    /// Expands a (case-insensitive) realm name or an unambiguous prefix of one to a known realm's
    ///  full name
    pub fn expand_realm(&self, name: &str) -> Option<String> {
        let known = once(self.config.realm.as_str())
            .chain(self.config.realms.iter().map(|r| r.name.as_str()));

        if let Some(exact) = known.clone().find(|r| r.eq_ignore_ascii_case(name)) {
            return Some(exact.to_string());
        }
        let prefix = name.to_ascii_uppercase();
        let mut matching = known.filter(|r| r.to_ascii_uppercase().starts_with(&prefix));
        match (matching.next(), matching.next()) {
            (Some(realm), None) => Some(realm.to_string()),
            _ => None,
        }
    }

    /// `user@realm` is foreign unless the realm is the local one. A bare `user` and the empty
    ///  (broadcast) recipient are local, and so is a realm nobody knows.
    pub fn resolve_recipient(&self, recipient: &str) -> Recipient {
        let Some((user, realm)) = recipient.rsplit_once('@') else {
            return Recipient::Local(recipient.to_string());
        };
        if realm.is_empty() {
            return Recipient::Local(user.to_string());
        }
        match self.expand_realm(realm) {
            Some(realm) if realm == self.config.realm => Recipient::Local(user.to_string()),
            Some(realm) => Recipient::Foreign { realm, user: user.to_string() },
            None => {
                debug!(recipient, "unknown realm - treating recipient as local");
                Recipient::Local(recipient.to_string())
            }
        }
    }

    /// the form subscriptions are keyed by: local users without realm, foreign users with their
    ///  realm's full name
    fn subscription_recipient(&self, recipient: &str) -> String {
        match self.resolve_recipient(recipient) {
            Recipient::Local(user) => user,
            Recipient::Foreign { realm, user } => format!("{}@{}", user, realm),
        }
    }

    //------------------------------ traffic from local clients and host relays

    fn on_client_notice(&mut self, mut notice: Notice, from: SocketAddr, now: Instant) {
        trace!(?from, uid=?notice.uid, kind=?notice.kind, class=%notice.class, "notice from client");

        if notice.kind.is_server_ack() || notice.kind == NoticeKind::HmAck || notice.kind == NoticeKind::ClientAck {
            trace!(?from, uid=?notice.uid, "ignoring ack from client");
            return;
        }

        match classify(&notice) {
            NoticeCategory::Control => {
                if notice.instance.eq_ignore_ascii_case(CTL_HM) {
                    self.on_host_manager_control(&notice, from);
                }
                else if notice.instance.eq_ignore_ascii_case(CTL_CLIENT) {
                    notice.authenticated = self.auth.verify(&notice, unix_now());
                    self.on_client_control(&notice, from, now);
                }
                else {
                    warn!(?from, instance=%notice.instance, opcode=%notice.opcode, "control notice not from a known realm server");
                    self.nack(&notice, from, Some(ACK_AUTH_FAILED));
                }
            }
            NoticeCategory::Admin => {
                warn!(?from, opcode=%notice.opcode, "server to server administration is not supported - dropping");
            }
            NoticeCategory::HostManager => {
                debug!(?from, opcode=%notice.opcode, "host manager control is meant for host relays - dropping");
            }
            NoticeCategory::UserLocation => {
                notice.authenticated = self.auth.verify(&notice, unix_now());
                if notice.class.eq_ignore_ascii_case(LOGIN_CLASS) {
                    self.on_login(&notice, from, now);
                }
                else {
                    self.on_locate(&notice, from, now);
                }
            }
            NoticeCategory::Ordinary => {
                notice.authenticated = self.auth.verify(&notice, unix_now());
                if notice.authenticated == AuthStatus::Failed {
                    warn!(?from, uid=?notice.uid, sender=%notice.sender, "authentication failed - handling notice as unauthenticated");
                }
                if !self.config.access.may_transmit(&notice) {
                    warn!(?from, uid=?notice.uid, sender=%notice.sender, class=%notice.class, "not authorized to send to restricted class");
                    self.nack(&notice, from, Some(ACK_AUTH_FAILED));
                    return;
                }

                match self.resolve_recipient(&notice.recipient) {
                    Recipient::Foreign { realm, .. } => {
                        // the sender's ack is deferred until the foreign realm acked
                        let relay_to = (notice.kind != NoticeKind::Unsafe).then_some(from);
                        self.hand_off(&realm, &notice, relay_to, now);
                    }
                    Recipient::Local(recipient) => {
                        // broadcasts stay in the local realm
                        let to_realms = !recipient.is_empty();
                        self.deliver_locally(&notice, &recipient, to_realms, now);
                        self.ack_client(&notice, from);
                    }
                }
            }
        }
    }

    fn on_host_manager_control(&mut self, notice: &Notice, from: SocketAddr) {
        debug!(?from, opcode=%notice.opcode, "host manager announcement");
        if opcode_is(notice, HM_BOOT) || opcode_is(notice, HM_FLUSH) {
            let num_cancelled = self.subscriptions.cancel_host(from.ip());
            let num_logged_out = self.locations.flush_host(from.ip());
            if num_cancelled > 0 || num_logged_out > 0 {
                info!(host=?from.ip(), num_cancelled, num_logged_out, "host manager restarted - dropped subscriptions and locations");
            }
        }
        self.reply(notice, from, NoticeKind::ServAck, Bytes::new());
    }

    fn on_client_control(&mut self, notice: &Notice, from: SocketAddr, now: Instant) {
        if self.config.require_authenticated_subscriptions && notice.authenticated != AuthStatus::Yes {
            warn!(?from, sender=%notice.sender, opcode=%notice.opcode, "unauthenticated subscription request");
            self.nack(notice, from, Some(ACK_AUTH_FAILED));
            return;
        }

        let client_addr = client_addr(notice, from);
        let client = Subscriber::Client(client_addr);

        if opcode_is(notice, CLIENT_CANCELSUB) {
            let num_cancelled = self.subscriptions.cancel_client(client_addr);
            debug!(?client_addr, num_cancelled, "cancelled subscriptions");
            self.ack_client(notice, from);
            return;
        }

        let (subscribe, realm_opcode) = if opcode_is(notice, CLIENT_SUBSCRIBE) {
            (true, REALM_ADD_SUBSCRIBE)
        }
        else if opcode_is(notice, CLIENT_UNSUBSCRIBE) {
            (false, REALM_UNSUBSCRIBE)
        }
        else {
            warn!(?from, opcode=%notice.opcode, "unknown client control opcode");
            self.nack(notice, from, None);
            return;
        };

        let principal = (notice.authenticated == AuthStatus::Yes).then_some(notice.sender.as_str());
        // subscriptions to foreign recipients are passed on to the realm that has them
        let mut by_realm: FxHashMap<String, Vec<String>> = Default::default();
        for (class, instance, recipient) in subscription_triples(notice) {
            if subscribe && !self.config.access.may_subscribe(&class, &instance, principal) {
                warn!(?from, sender=%notice.sender, class, instance, "not authorized to subscribe to restricted class - skipping");
                continue;
            }
            let key = SubscriptionKey::new(&class, &instance, &self.subscription_recipient(&recipient));
            if subscribe {
                self.subscriptions.subscribe(key, client.clone());
            }
            else {
                self.subscriptions.unsubscribe(&key, &client);
            }

            if let Recipient::Foreign { realm, user } = self.resolve_recipient(&recipient) {
                by_realm.entry(realm)
                    .or_default()
                    .extend([class, instance, user]);
            }
        }
        for (realm, fields) in by_realm {
            self.send_realm_control(&realm, realm_opcode, &fields, now);
        }
        self.ack_client(notice, from);
    }

    /// Sends copies to matching subscribers: unreliably to local clients and, if `to_realms`,
    ///  through a handoff to subscribed foreign realms
    fn deliver_locally(&mut self, notice: &Notice, recipient: &str, to_realms: bool, now: Instant) {
        let subscribers = self.subscriptions.matches(&notice.class, &notice.instance, recipient);
        trace!(uid=?notice.uid, num_subscribers=subscribers.len(), "delivering locally");

        for subscriber in subscribers {
            match subscriber {
                Subscriber::Client(addr) => send_unreliable(self.sender.as_ref(), addr, notice),
                Subscriber::Realm(realm) if to_realms => {
                    // on the other side, the recipient must name this realm
                    let mut copy = notice.clone();
                    if !copy.recipient.contains('@') {
                        copy.recipient = format!("{}@{}", copy.recipient, self.config.realm);
                    }
                    self.hand_off(&realm, &copy, None, now);
                }
                Subscriber::Realm(_) => {}
            }
        }
    }

    //------------------------------ traffic from foreign realms

    fn on_realm_notice(&mut self, realm: &str, mut notice: Notice, from: SocketAddr, now: Instant) {
        trace!(realm, ?from, uid=?notice.uid, kind=?notice.kind, "notice from realm");
        self.queue.peer_contact(realm, from, now);

        if notice.kind.is_server_ack() {
            let positive = notice.kind == NoticeKind::ServAck;
            if let AckMatch::Complete(event) = self.queue.on_ack(&notice.uid, positive) {
                self.on_delivery_complete(event);
            }
            return;
        }

        notice.authenticated = self.auth.verify_as(&notice, &server_principal(realm), unix_now());

        match classify(&notice) {
            NoticeCategory::Control if notice.instance.eq_ignore_ascii_case(CTL_REALM) => {
                self.on_realm_control(realm, &notice, from, now);
            }
            NoticeCategory::Control | NoticeCategory::Admin | NoticeCategory::HostManager => {
                warn!(realm, class=%notice.class, opcode=%notice.opcode, "unexpected control notice from realm");
                self.nack(&notice, from, None);
            }
            NoticeCategory::UserLocation if notice.class.eq_ignore_ascii_case(LOCATE_CLASS) => {
                self.on_realm_locate(realm, &notice, from, now);
            }
            NoticeCategory::UserLocation => {
                // the realm's logins and logouts go to local subscribers of that realm's announcements
                notice.recipient = format!("@{}", realm);
                let recipient = self.subscription_recipient(&notice.recipient);
                self.deliver_locally(&notice, &recipient, false, now);
                self.ack_client(&notice, from);
            }
            NoticeCategory::Ordinary => {
                if notice.authenticated == AuthStatus::Failed {
                    warn!(realm, uid=?notice.uid, "realm authentication failed - delivering as unauthenticated");
                }
                // notices from a realm are never passed on to other realms
                let recipient = self.subscription_recipient(&notice.recipient);
                self.deliver_locally(&notice, &recipient, false, now);
                self.ack_client(&notice, from);
            }
        }
    }

    fn on_realm_control(&mut self, realm: &str, notice: &Notice, from: SocketAddr, now: Instant) {
        if notice.authenticated != AuthStatus::Yes {
            warn!(realm, ?from, opcode=%notice.opcode, "unauthenticated realm control notice");
            self.nack(notice, from, Some(ACK_AUTH_FAILED));
            return;
        }

        let result = match notice.opcode.to_ascii_uppercase().as_str() {
            REALM_ADD_SUBSCRIBE | REALM_REQ_SUBSCRIBE => {
                for (class, instance, recipient) in subscription_triples(notice) {
                    self.subscriptions.subscribe(SubscriptionKey::new(&class, &instance, &recipient), Subscriber::Realm(realm.to_string()));
                }
                Ok(())
            }
            REALM_UNSUBSCRIBE => {
                let subscriber = Subscriber::Realm(realm.to_string());
                for (class, instance, recipient) in subscription_triples(notice) {
                    self.subscriptions.unsubscribe(&SubscriptionKey::new(&class, &instance, &recipient), &subscriber);
                }
                Ok(())
            }
            REALM_BOOT => {
                info!(realm, ?from, "realm server booted");
                // the realm lost its state and sends its subscriptions again
                self.subscriptions.cancel_realm(realm);
                self.queue.set_server(realm, from, now)
                    .map(|_| self.resend_subscriptions(realm, now))
            }
            SERVER_SHUTDOWN => {
                let hint = notice.field_str(0)
                    .and_then(|s| SocketAddr::from_str(&s).ok());
                info!(realm, ?from, ?hint, "realm server shutting down");
                self.queue.shutdown_hint(realm, hint, now)
            }
            _ => Err(anyhow!("unknown realm control opcode {}", notice.opcode)),
        };

        match result {
            Ok(()) => self.reply(notice, from, NoticeKind::ServAck, Bytes::new()),
            Err(e) => {
                warn!(realm, "error handling realm control notice: {}", e);
                self.nack(notice, from, None);
            }
        }
    }

    /// sends a realm all local clients' subscriptions for its recipients
    fn resend_subscriptions(&mut self, realm: &str, now: Instant) {
        let mut triples = BTreeSet::new();
        for (key, subscriber) in self.subscriptions.iter() {
            if !matches!(subscriber, Subscriber::Client(_)) {
                continue;
            }
            if let Recipient::Foreign { realm: r, user } = self.resolve_recipient(&key.recipient) {
                if r == realm {
                    triples.insert((key.class.clone(), key.instance.clone(), user));
                }
            }
        }
        if triples.is_empty() {
            return;
        }
        debug!(realm, num=triples.len(), "sending subscriptions to realm");
        let fields = triples.into_iter()
            .flat_map(|(c, i, r)| [c, i, r])
            .collect::<Vec<_>>();
        self.send_realm_control(realm, REALM_ADD_SUBSCRIBE, &fields, now);
    }

    //------------------------------ user locations

    fn is_local_principal(&self, principal: &str) -> bool {
        match principal.rsplit_once('@') {
            Some((_, realm)) => realm.eq_ignore_ascii_case(&self.config.realm),
            None => true,
        }
    }

    /// Logins and logouts of local clients. A login must be authenticated as the user it logs in,
    ///  a logout only has to come from the address the user is logged in at.
    fn on_login(&mut self, notice: &Notice, from: SocketAddr, now: Instant) {
        let client = client_addr(notice, from);

        if opcode_is(notice, LOGIN_USER_LOGOUT) {
            match self.locations.logout(&notice.instance, client) {
                Some(exposure) => self.announce_login(notice, exposure.announcement(), now),
                None => {
                    self.nack(notice, from, Some(ACK_NOT_FOUND));
                    return;
                }
            }
            self.ack_client(notice, from);
            return;
        }

        if notice.authenticated != AuthStatus::Yes || notice.sender != notice.instance {
            warn!(?from, sender=%notice.sender, user=%notice.instance, opcode=%notice.opcode, "unauthenticated login notice");
            self.nack(notice, from, Some(ACK_AUTH_FAILED));
            return;
        }

        if opcode_is(notice, LOGIN_USER_FLUSH) {
            let num_flushed = self.locations.flush_user(&notice.instance);
            debug!(user=%notice.instance, num_flushed, "flushed user's locations");
        }
        else if opcode_is(notice, EXPOSE_NONE) {
            if self.locations.logout(&notice.instance, client).is_none() {
                self.nack(notice, from, Some(ACK_NOT_FOUND));
                return;
            }
        }
        else if let Some(exposure) = Exposure::from_opcode(&notice.opcode) {
            match Location::from_login(notice, client, exposure) {
                Ok(location) => self.locations.login(location),
                Err(e) => {
                    warn!(?from, "invalid login notice: {}", e);
                    self.nack(notice, from, None);
                    return;
                }
            }
            let mut login = notice.clone();
            login.opcode = LOGIN_USER_LOGIN.to_string();
            self.announce_login(&login, exposure.announcement(), now);
        }
        else {
            warn!(?from, opcode=%notice.opcode, "unknown login opcode");
            self.nack(notice, from, None);
            return;
        }
        self.ack_client(notice, from);
    }

    /// tells subscribers of the login class about a login or logout
    fn announce_login(&mut self, notice: &Notice, announcement: Announcement, now: Instant) {
        let to_realms = match announcement {
            Announcement::Silent => return,
            Announcement::Local => false,
            Announcement::External => true,
        };
        let recipient = self.subscription_recipient(&notice.recipient);
        self.deliver_locally(notice, &recipient, to_realms, now);
    }

    /// A copy of a locate request with the machine, time and tty of every location the requester
    ///  may see as body fields
    fn location_answer(&self, request: &Notice, local_requester: bool) -> Notice {
        let fields = self.locations.locate(&request.instance, local_requester)
            .into_iter()
            .flat_map(|l| l.fields())
            .collect::<Vec<_>>();
        request.reply(NoticeKind::Acked, body_from_fields(&fields))
    }

    /// Locate requests of local clients. Users of a foreign realm are located by that realm's
    ///  server, and its answer is passed on to the client when it arrives.
    fn on_locate(&mut self, notice: &Notice, from: SocketAddr, now: Instant) {
        if !opcode_is(notice, LOCATE_LOCATE) {
            warn!(?from, opcode=%notice.opcode, "unknown locate opcode");
            self.nack(notice, from, None);
            return;
        }
        self.ack_client(notice, from);
        let client = client_addr(notice, from);

        match self.resolve_recipient(&notice.instance) {
            Recipient::Foreign { realm, .. } => {
                let mut request = notice.clone();
                request.opcode = REALM_REQ_LOCATE.to_string();
                request.sender_addr = Some(client.ip());
                request.port = client.port();
                // realms only answer locate requests authenticated by this server
                request.authenticated = AuthStatus::Yes;
                debug!(realm, user=%notice.instance, "forwarding locate request");
                self.hand_off(&realm, &request, None, now);
            }
            Recipient::Local(_) => {
                let local_requester = notice.authenticated == AuthStatus::Yes && self.is_local_principal(&notice.sender);
                let answer = self.location_answer(notice, local_requester);
                send_unreliable(self.sender.as_ref(), client, &answer);
            }
        }
    }

    fn on_realm_locate(&mut self, realm: &str, notice: &Notice, from: SocketAddr, now: Instant) {
        if notice.authenticated != AuthStatus::Yes {
            warn!(realm, ?from, opcode=%notice.opcode, "unauthenticated locate notice from realm");
            self.nack(notice, from, Some(ACK_AUTH_FAILED));
            return;
        }

        if opcode_is(notice, REALM_REQ_LOCATE) {
            self.ack_client(notice, from);
            let mut answer = self.location_answer(notice, false);
            answer.opcode = REALM_ANS_LOCATE.to_string();
            answer.authenticated = AuthStatus::Yes;
            self.hand_off(realm, &answer, None, now);
        }
        else if opcode_is(notice, REALM_ANS_LOCATE) {
            self.ack_client(notice, from);
            let origin = notice.origin_uid();
            let to = SocketAddr::new(notice.sender_addr.unwrap_or(origin.origin), notice.port);

            let mut answer = notice.reply(NoticeKind::Acked, notice.body.clone());
            answer.uid = origin;
            answer.multi_uid = None;
            answer.opcode = LOCATE_LOCATE.to_string();
            debug!(realm, ?to, user=%notice.instance, "passing on location answer");
            send_unreliable(self.sender.as_ref(), to, &answer);
        }
        else {
            warn!(realm, opcode=%notice.opcode, "unknown locate opcode from realm");
            self.nack(notice, from, None);
        }
    }

    //------------------------------ handoff to foreign realms

    /// A reliable control notice to a realm. It is authenticated as this realm's server, which
    ///  may require fetching credentials first.
    fn send_realm_control(&mut self, realm: &str, opcode: &str, fields: &[String], now: Instant) {
        let notice = self.realm_control_notice(opcode, fields);
        self.hand_off(realm, &notice, None, now);
    }

    fn realm_control_notice(&mut self, opcode: &str, fields: &[String]) -> Notice {
        let mut notice = Notice::new(NoticeKind::Acked, self.uids.next_uid(), ZEPHYR_CTL_CLASS, CTL_REALM, opcode);
        notice.sender = server_principal(&self.config.realm);
        notice.port = self.config.server_addr.port();
        notice.body = body_from_fields(&fields.iter().map(|f| f.as_str()).collect::<Vec<_>>());
        notice.authenticated = AuthStatus::Yes;
        notice
    }

    /// Hands a notice to a foreign realm. Notices that were authenticated here are authenticated
    ///  towards the realm as well, so they wait if there is no valid credential for it yet.
    fn hand_off(&mut self, realm: &str, notice: &Notice, relay_to: Option<SocketAddr>, now: Instant) {
        let with_auth = notice.authenticated == AuthStatus::Yes;
        if with_auth {
            let has_credential = self.credentials.get(realm)
                .map(|c| c.is_valid_at(unix_now()))
                .unwrap_or(false);
            if !has_credential {
                self.park(realm, notice.clone(), relay_to, now);
                return;
            }
        }
        self.send_handoff(realm, notice, relay_to, with_auth, now);
    }

    /// Parked handoffs count against the same limit as pending deliveries. Each waits for at most
    ///  one full backoff schedule.
    fn park(&mut self, realm: &str, notice: Notice, relay_to: Option<SocketAddr>, now: Instant) {
        if self.queue.len() + self.num_parked() >= self.config.delivery.max_pending {
            warn!(realm, uid=?notice.uid, "too many pending handoffs - dropping notice");
            if let Some(to) = relay_to {
                self.nack(&notice, to, Some(ACK_LOST));
            }
            return;
        }

        debug!(realm, uid=?notice.uid, "waiting for credentials for realm");
        let deadline = now + self.config.delivery.backoff.total();
        self.parked.entry(realm.to_string())
            .or_default()
            .push(ParkedHandoff { notice, relay_to, deadline });
        if self.fetching.insert(realm.to_string()) {
            self.credential_requests.push(realm.to_string());
        }
    }

    fn send_handoff(&mut self, realm: &str, notice: &Notice, relay_to: Option<SocketAddr>, with_auth: bool, now: Instant) {
        let result = self.prepare_handoff(realm, notice, with_auth)
            .and_then(|fragments| self.queue.send_group(realm, fragments, notice.clone(), relay_to, now));

        match result {
            Ok(handle) => debug!(realm, uid=?notice.uid, ?handle, with_auth, "handed off notice"),
            Err(e) => {
                warn!(realm, uid=?notice.uid, "error handing off notice: {}", e);
                if let Some(to) = relay_to {
                    self.nack(notice, to, Some(ACK_LOST));
                }
            }
        }
    }

    /// The packets for a handoff: a fresh uid, the original uid as multi-uid, and fragmentation if
    ///  the notice does not fit into a single packet. Each fragment gets its own uid and its own
    ///  checksum.
    fn prepare_handoff(&mut self, realm: &str, notice: &Notice, with_auth: bool) -> anyhow::Result<Vec<Notice>> {
        let credential = if with_auth {
            Some(self.credentials.get(realm)
                .cloned()
                .ok_or_else(|| anyhow!("no credentials for realm {}", realm))?)
        }
        else {
            None
        };

        let mut template = notice.clone();
        template.kind = NoticeKind::Acked;
        template.uid = self.uids.next_uid();
        template.multi_uid = Some(notice.origin_uid());
        template.auth_requested = false;
        template.authenticator = Bytes::new();
        template.checksum = Default::default();
        template.authenticated = AuthStatus::No;
        if let Some(credential) = &credential {
            template.auth_requested = true;
            template.authenticator = credential.ticket.clone();
        }

        let base = notice.fragment
            .unwrap_or_else(|| FragmentRange::whole(notice.body.len()));
        let header_len = {
            let mut sample = template.clone();
            sample.fragment = Some(base);
            sample.header_len()
        };

        let pieces = if header_len + notice.body.len() <= self.config.max_packet_len {
            vec![(notice.fragment, notice.body.clone())]
        }
        else {
            let frag_size = self.config.max_packet_len
                .checked_sub(header_len + self.config.fragment_fudge)
                .filter(|&s| s > 0)
                .ok_or_else(|| anyhow!("a header of {} bytes leaves no room for data", header_len))?;
            split_body(&notice.body, base, frag_size)?
                .into_iter()
                .map(|(range, body)| (Some(range), body))
                .collect()
        };

        let first = template.uid;
        let mut result = Vec::with_capacity(pieces.len());
        for (k, (fragment, body)) in pieces.into_iter().enumerate() {
            let mut f = template.clone();
            f.uid = first.successor(k as u32);
            f.fragment = fragment;
            f.body = body;
            if let Some(credential) = &credential {
                authenticate(&mut f, credential.ticket.clone(), &credential.session_key)?;
            }
            result.push(f);
        }
        self.uids.reserve(first, result.len() as u32);

        if result.len() > 1 {
            debug!(realm, uid=?notice.uid, num_fragments=result.len(), "fragmented notice for handoff");
        }
        Ok(result)
    }

    fn on_delivery_complete(&self, event: DeliveryEvent) {
        let Some(to) = event.relay_to else {
            if event.outcome != DeliveryOutcome::Acked {
                warn!(realm=%event.peer, uid=?event.original.uid, outcome=?event.outcome, "handoff was not acked");
            }
            return;
        };
        match event.outcome {
            DeliveryOutcome::Acked => self.reply(&event.original, to, NoticeKind::ServAck, body_from_fields(&[ACK_SENT])),
            DeliveryOutcome::Nacked | DeliveryOutcome::Failed => self.nack(&event.original, to, Some(ACK_LOST)),
        }
    }

    //------------------------------ credentials

    /// realms that need credentials fetched; each realm is requested once until its result arrives
    pub fn take_credential_requests(&mut self) -> Vec<String> {
        std::mem::take(&mut self.credential_requests)
    }

    /// A background fetch completed. Handoffs waiting for the realm are sent now: authenticated if
    ///  the fetch succeeded, unauthenticated otherwise.
    pub fn on_credentials(&mut self, result: CredentialResult, now: Instant) {
        let realm = result.realm;
        self.fetching.remove(&realm);

        let with_auth = match result.credential {
            Ok(credential) => {
                info!(realm, expires=credential.expires, "received credentials for realm");
                self.credentials.insert(realm.clone(), credential);
                true
            }
            Err(e) => {
                warn!(realm, "error fetching credentials - sending unauthenticated: {}", e);
                false
            }
        };

        for parked in self.parked.remove(&realm).unwrap_or_default() {
            self.send_handoff(&realm, &parked.notice, parked.relay_to, with_auth, now);
        }
        self.log_transitions();
    }

    /// periodic cleanup of expired session keys and credentials. `now` is in seconds since the epoch.
    pub fn sweep(&mut self, now: u64) {
        let num_keys = self.auth.sweep(now);
        let before = self.credentials.len();
        self.credentials.retain(|_, c| c.is_valid_at(now));
        debug!(num_keys, num_credentials=before - self.credentials.len(), "swept expired credentials");
    }

    //------------------------------ announcements

    /// tells every foreign realm that this server (re)started, asking them for their subscriptions
    pub fn announce_boot(&mut self, now: Instant) {
        let realms = self.config.realms.iter()
            .map(|r| r.name.clone())
            .collect::<Vec<_>>();
        for realm in realms {
            debug!(realm, "announcing boot");
            self.send_realm_control(&realm, REALM_BOOT, &[], now);
        }
        self.log_transitions();
    }

    /// Tells every foreign realm that this server goes away, optionally suggesting another server
    ///  of this realm. This is a last word and not retried.
    pub fn announce_shutdown(&mut self, hint: Option<SocketAddr>) {
        let fields = hint.map(|h| vec![h.to_string()]).unwrap_or_default();
        let now_unix = unix_now();

        let targets = self.queue.peers().iter()
            .filter_map(|p| p.current_addr()
                .or_else(|| p.candidates().first().copied())
                .map(|addr| (p.name().to_string(), addr)))
            .collect::<Vec<_>>();

        for (realm, addr) in targets {
            let mut notice = self.realm_control_notice(SERVER_SHUTDOWN, &fields);
            notice.kind = NoticeKind::Unsafe;
            notice.authenticated = AuthStatus::No;
            match self.credentials.get(&realm) {
                Some(c) if c.is_valid_at(now_unix) => {
                    if let Err(e) = authenticate(&mut notice, c.ticket.clone(), &c.session_key) {
                        warn!(realm, "error authenticating shutdown announcement: {}", e);
                    }
                }
                _ => debug!(realm, "no credentials - shutdown announcement is unauthenticated"),
            }
            info!(realm, ?addr, ?hint, "announcing shutdown");
            send_unreliable(self.sender.as_ref(), addr, &notice);
        }
    }
}

/// the address a client receives notices at: its host, and the port it names in the notice
fn client_addr(notice: &Notice, from: SocketAddr) -> SocketAddr {
    let port = if notice.port != 0 { notice.port } else { from.port() };
    SocketAddr::new(from.ip(), port)
}

/// (class, instance, recipient) triples in a subscription notice's body. Incomplete trailing
///  fields are ignored.
fn subscription_triples(notice: &Notice) -> Vec<(String, String, String)> {
    let fields = notice.fields();
    let field = |f: &[u8]| String::from_utf8_lossy(f).to_string();
    fields.chunks_exact(3)
        .map(|t| (field(t[0]), field(t[1]), field(t[2])))
        .collect()
}
