//! End-to-end negotiation between client and server contexts.
//!
//! Exercises mechanism selection, the spnego wrapper, chunked tokens, and
//! message protection across the full context lifecycle.

use std::sync::Arc;

use kagi::spnego::{NegInit, NegResp, NegState};
use kagi::{
    ATTR_NEGOTIATED_BY, ATTR_PEER_KEY, ContextBuilder, Credentials, Error, Features, KeyPair,
    Registry, Result, SecurityContext, Selector, State,
};
use rand_core::OsRng;

struct Principals {
    client_kp: KeyPair,
    server_kp: KeyPair,
}

impl Principals {
    fn generate() -> Self {
        Self {
            client_kp: KeyPair::generate(&mut OsRng),
            server_kp: KeyPair::generate(&mut OsRng),
        }
    }

    /// Client able to run `krb5` against `host/db`.
    fn ticket_client(&self) -> Credentials {
        Credentials::new("alice")
            .with_keypair(self.client_kp.clone())
            .with_service("host/db", self.server_kp.public)
    }

    /// Server accepting `krb5` from alice.
    fn ticket_server(&self) -> Credentials {
        Credentials::new("host/db")
            .with_keypair(self.server_kp.clone())
            .with_peer("alice", self.client_kp.public)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kagi=debug")
        .with_test_writer()
        .try_init();
}

fn registry() -> Arc<Registry> {
    Arc::new(Registry::with_defaults())
}

fn context(
    builder: ContextBuilder,
    credentials: Credentials,
    features: Features,
    selector: Selector<'_>,
) -> SecurityContext {
    builder
        .with_registry(registry())
        .with_credentials(credentials)
        .with_features(features)
        .start(selector)
        .unwrap()
}

/// Shuttle tokens until both sides finish. Returns the number of rounds.
fn run(client: &mut SecurityContext, server: &mut SecurityContext) -> Result<usize> {
    run_from(client, server, Vec::new())
}

/// Like [`run`], with `to_client` already delivered to the client.
fn run_from(
    client: &mut SecurityContext,
    server: &mut SecurityContext,
    mut to_client: Vec<u8>,
) -> Result<usize> {
    let mut to_server = Vec::new();
    let (mut client_done, mut server_done) = (false, false);
    let mut rounds = 0;
    while !client_done || !server_done {
        rounds += 1;
        assert!(rounds < 10_000, "exchange did not converge");
        if !client_done {
            let update = client.update(&to_client)?;
            client_done = update.finished;
            to_server = update.output;
        }
        if !server_done {
            let update = server.update(&to_server)?;
            server_done = update.finished;
            to_client = update.output;
        }
    }
    Ok(rounds)
}

fn assert_conversation(client: &mut SecurityContext, server: &mut SecurityContext) {
    let to_server = client.wrap(b"Hello Server").unwrap();
    assert_eq!(server.unwrap(&to_server).unwrap(), b"Hello Server");
    let to_client = server.wrap(b"Hello Client").unwrap();
    assert_eq!(client.unwrap(&to_client).unwrap(), b"Hello Client");
}

// =========================================================================
// Direct mechanism selection
// =========================================================================

#[test]
fn gssapi_with_seal() {
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        p.ticket_client(),
        Features::SEAL,
        Selector::SaslName("GSSAPI"),
    );
    let mut server = context(
        ContextBuilder::server(),
        p.ticket_server(),
        Features::SEAL,
        Selector::SaslName("GSSAPI"),
    );

    let rounds = run(&mut client, &mut server).unwrap();
    assert!(rounds <= 4, "took {rounds} rounds");
    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);
    assert!(client.is_established() && server.is_established());

    let sealed = client.wrap(b"Hello Server").unwrap();
    assert!(!sealed.windows(12).any(|w| w == b"Hello Server"));
    assert_eq!(server.unwrap(&sealed).unwrap(), b"Hello Server");
    assert_conversation(&mut client, &mut server);
    assert_eq!(client.session_key().unwrap(), server.session_key().unwrap());

    let info = client.session_info().unwrap();
    assert!(info.features.contains(Features::SEAL | Features::SIGN));
    assert!(info.mutual);
}

#[test]
fn ntlm_without_features_still_signs() {
    let mut client = context(
        ContextBuilder::client(),
        Credentials::new("alice").with_password("correct horse"),
        Features::NONE,
        Selector::Name("ntlmssp"),
    );
    let mut server = context(
        ContextBuilder::server(),
        Credentials::new("fileserver").with_account("alice", "correct horse"),
        Features::NONE,
        Selector::Name("ntlmssp"),
    );
    run(&mut client, &mut server).unwrap();

    let wrapped = client.wrap(b"visible").unwrap();
    assert!(wrapped.windows(7).any(|w| w == b"visible"));
    assert_eq!(server.unwrap(&wrapped).unwrap(), b"visible");

    let info = server.session_info().unwrap();
    assert_eq!(info.principal, "alice");
    assert_eq!(info.mechanism, "ntlmssp");
    assert!(!info.mutual);
    assert_eq!(info.attribute(ATTR_NEGOTIATED_BY), None);
}

#[test]
fn wrong_password_fails_both_contexts_stay_unusable() {
    let mut client = context(
        ContextBuilder::client(),
        Credentials::new("alice").with_password("guess"),
        Features::SIGN,
        Selector::Name("ntlmssp"),
    );
    let mut server = context(
        ContextBuilder::server(),
        Credentials::new("fileserver").with_account("alice", "correct horse"),
        Features::SIGN,
        Selector::Name("ntlmssp"),
    );
    assert_eq!(
        run(&mut client, &mut server).unwrap_err(),
        Error::AuthenticationFailed
    );
    assert_eq!(server.state(), State::Failed);
    assert_eq!(server.wrap(b"x").unwrap_err(), Error::AlreadyFailed);
    assert_eq!(server.session_info().unwrap_err(), Error::AlreadyFailed);
}

#[test]
fn untrusted_client_key_rejected() {
    let p = Principals::generate();
    let stranger = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        Credentials::new("alice")
            .with_keypair(stranger.client_kp.clone())
            .with_service("host/db", p.server_kp.public),
        Features::SIGN,
        Selector::Name("krb5"),
    );
    let mut server = context(
        ContextBuilder::server(),
        p.ticket_server(),
        Features::SIGN,
        Selector::Name("krb5"),
    );
    assert_eq!(
        run(&mut client, &mut server).unwrap_err(),
        Error::AuthenticationFailed
    );
    assert_eq!(server.state(), State::Failed);
}

// =========================================================================
// spnego
// =========================================================================

#[test]
fn spnego_selects_krb5_optimistically() {
    init_tracing();
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        p.ticket_client(),
        Features::SEAL,
        Selector::Auto,
    );
    let mut server = context(
        ContextBuilder::server(),
        p.ticket_server(),
        Features::SEAL,
        Selector::Auto,
    );

    let rounds = run(&mut client, &mut server).unwrap();
    assert_eq!(rounds, 2);
    assert_eq!(client.mechanism_name(), Some("spnego"));
    assert_conversation(&mut client, &mut server);
    assert_eq!(client.session_key().unwrap(), server.session_key().unwrap());

    let info = server.session_info().unwrap();
    assert_eq!(info.principal, "alice");
    assert_eq!(info.mechanism, "krb5");
    assert!(info.mutual);
    assert_eq!(info.attribute(ATTR_NEGOTIATED_BY), Some("spnego"));
    assert_eq!(
        info.attribute(ATTR_PEER_KEY),
        Some(p.client_kp.public.fingerprint().as_str())
    );
}

#[test]
fn spnego_falls_back_when_server_lacks_first_choice() {
    init_tracing();
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        p.ticket_client().with_password("pw"),
        Features::SIGN,
        Selector::Auto,
    );
    let mut server = context(
        ContextBuilder::server(),
        Credentials::new("host/db").with_account("alice", "pw"),
        Features::SIGN,
        Selector::Auto,
    );

    run(&mut client, &mut server).unwrap();
    assert_eq!(client.session_info().unwrap().mechanism, "ntlmssp");
    assert_eq!(server.session_info().unwrap().mechanism, "ntlmssp");
    assert_conversation(&mut client, &mut server);
    assert_eq!(client.session_key().unwrap(), server.session_key().unwrap());
}

#[test]
fn spnego_with_small_updates_takes_many_rounds() {
    let p = Principals::generate();
    let start = |builder: ContextBuilder, creds: Credentials| {
        builder
            .with_registry(registry())
            .with_credentials(creds)
            .with_features(Features::SIGN)
            .with_max_update_size(5)
            .start(Selector::Name("spnego"))
            .unwrap()
    };
    let mut client = start(ContextBuilder::client(), p.ticket_client());
    let mut server = start(ContextBuilder::server(), p.ticket_server());

    let rounds = run(&mut client, &mut server).unwrap();
    assert!(rounds > 10, "only {rounds} rounds");
    assert_eq!(client.session_key().unwrap(), server.session_key().unwrap());
    assert_conversation(&mut client, &mut server);
}

#[test]
fn spnego_without_common_mechanism() {
    init_tracing();
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        Credentials::new("alice").with_password("pw"),
        Features::NONE,
        Selector::Auto,
    );
    let mut server = context(
        ContextBuilder::server(),
        p.ticket_server(),
        Features::NONE,
        Selector::Auto,
    );
    assert_eq!(
        run(&mut client, &mut server).unwrap_err(),
        Error::NoCompatibleMechanism
    );
    assert_eq!(server.state(), State::Failed);
}

#[test]
fn spnego_client_without_credentials() {
    let mut client = ContextBuilder::client()
        .with_registry(registry())
        .start(Selector::Auto)
        .unwrap();
    assert_eq!(client.update(&[]).unwrap_err(), Error::NoCompatibleMechanism);
    assert_eq!(client.state(), State::Failed);
}

#[test]
fn spnego_reject_ends_negotiation() {
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        p.ticket_client(),
        Features::NONE,
        Selector::Auto,
    );
    client.update(&[]).unwrap();
    let reject = NegResp {
        state: NegState::Reject,
        mech: String::new(),
        token: Vec::new(),
        mic: Vec::new(),
    };
    assert_eq!(
        client.update(&reject.encode().unwrap()).unwrap_err(),
        Error::NoCompatibleMechanism
    );
    assert_eq!(client.state(), State::Failed);
}

#[test]
fn stripped_offer_detected_by_mic() {
    init_tracing();
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        p.ticket_client().with_password("pw"),
        Features::SIGN,
        Selector::Auto,
    );
    let mut server = context(
        ContextBuilder::server(),
        p.ticket_server().with_account("alice", "pw"),
        Features::SIGN,
        Selector::Auto,
    );

    let offer = NegInit::decode(&client.update(&[]).unwrap().output).unwrap();
    assert_eq!(offer.mechs, ["krb5", "ntlmssp"]);
    assert!(offer.token.is_some());

    // Downgrade: hide krb5 from the server.
    let stripped = NegInit {
        mechs: vec!["ntlmssp".into()],
        token: None,
    };
    let reply = server.update(&stripped.encode().unwrap()).unwrap();
    let err = run_from(&mut client, &mut server, reply.output).unwrap_err();
    assert!(matches!(err, Error::Negotiation(ref m) if m.contains("MIC")), "{err}");
    assert_eq!(client.state(), State::Failed);
}

#[test]
fn unoffered_choice_rejected() {
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        p.ticket_client(),
        Features::NONE,
        Selector::Auto,
    );
    client.update(&[]).unwrap();
    let resp = NegResp {
        state: NegState::Incomplete,
        mech: "ntlmssp".into(),
        token: Vec::new(),
        mic: Vec::new(),
    };
    assert!(matches!(
        client.update(&resp.encode().unwrap()),
        Err(Error::Negotiation(_))
    ));
}

// =========================================================================
// Message protection
// =========================================================================

fn established_pair(features: Features) -> (SecurityContext, SecurityContext) {
    let p = Principals::generate();
    let mut client = context(
        ContextBuilder::client(),
        p.ticket_client(),
        features,
        Selector::Name("krb5"),
    );
    let mut server = context(
        ContextBuilder::server(),
        p.ticket_server(),
        features,
        Selector::Name("krb5"),
    );
    run(&mut client, &mut server).unwrap();
    (client, server)
}

#[test]
fn tampered_token_rejected_without_losing_sync() {
    for features in [Features::SIGN, Features::SEAL] {
        let (mut client, mut server) = established_pair(features);
        let token = client.wrap(b"transfer 10").unwrap();

        let mut tampered = token.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(server.unwrap(&tampered), Err(Error::IntegrityFailure));
        assert_eq!(server.unwrap(&token).unwrap(), b"transfer 10");
    }
}

#[test]
fn replayed_token_rejected() {
    let (mut client, mut server) = established_pair(Features::SIGN);
    let token = client.wrap(b"once").unwrap();
    assert_eq!(server.unwrap(&token).unwrap(), b"once");
    assert_eq!(server.unwrap(&token), Err(Error::IntegrityFailure));
}

#[test]
fn reflected_token_rejected() {
    let (mut client, _) = established_pair(Features::SEAL);
    let token = client.wrap(b"mirror").unwrap();
    assert_eq!(client.unwrap(&token), Err(Error::IntegrityFailure));
}

#[test]
fn mode_mismatch_rejected() {
    let (mut client, mut server) = established_pair(Features::SIGN);
    let mut token = client.wrap(b"signed").unwrap();
    token[0] = 0x02;
    assert_eq!(server.unwrap(&token), Err(Error::IntegrityFailure));
    assert_eq!(server.unwrap(&[]), Err(Error::IntegrityFailure));
}

#[test]
fn update_after_establishment_rejected() {
    let (mut client, _) = established_pair(Features::NONE);
    assert!(matches!(client.update(&[]), Err(Error::InvalidState(_))));
    assert_eq!(client.state(), State::Established);
}
