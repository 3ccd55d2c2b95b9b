//! Client-client handshake: `Connected → VersionExchanged → Authenticated → Ready`.
//!
//! The dialing side opens with `$MyNick`/`$Lock`; the listening side answers with
//! `$MyNick $Lock $Supports $Direction $Key`, and the dialer finishes with
//! `$Supports $Direction $Key`.

use rand::Rng;

use crate::connection::Role;
use crate::nmdc::{self, Direction, PeerCommand, EXTENDED_PREFIX, PEER_FEATURES};
use crate::wire::{encode_frame, Encoding};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connected,
    VersionExchanged,
    Authenticated,
    Ready,
    Closed,
}

/// Capabilities from `$Supports`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub adcget: bool,
    pub tthl: bool,
    pub tthf: bool,
    pub xml_bzlist: bool,
    pub minislots: bool,
}

impl Features {
    pub fn from_list(list: &[String]) -> Self {
        let has = |f: &str| list.iter().any(|s| s == f);
        Self {
            adcget: has("ADCGet"),
            tthl: has("TTHL"),
            tthf: has("TTHF"),
            xml_bzlist: has("XmlBZList"),
            minislots: has("MiniSlots"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake timed out in {0:?}")]
    Timeout(HandshakeState),
    #[error("unexpected {command} in {state:?}")]
    Unexpected {
        command: &'static str,
        state: HandshakeState,
    },
    #[error("peer lacks required feature {0}")]
    MissingFeature(&'static str),
    #[error("key does not match our lock")]
    BadKey,
    #[error("both sides want to {0:?}")]
    DirectionConflict(Direction),
    #[error("handshake already closed")]
    Closed,
}

/// Outcome of a finished handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub nick: String,
    /// Our direction on this connection.
    pub direction: Direction,
    pub features: Features,
}

/// What one step produced.
#[derive(Debug, Default)]
pub struct Step {
    pub send: Vec<Vec<u8>>,
    /// Remote nick just became known; the host checks it before the next frame.
    pub identified: Option<String>,
    pub ready: Option<Negotiated>,
}

pub struct PeerHandshake {
    role: Role,
    state: HandshakeState,
    encoding: Encoding,
    my_nick: String,
    my_lock: String,
    want: Direction,
    number: u16,
    remote_nick: Option<String>,
    remote_lock: Option<Vec<u8>>,
    remote_direction: Option<(Direction, u16)>,
    features: Option<Features>,
    sent_reply: bool,
    elapsed: u64,
    timeout: u64,
}

impl PeerHandshake {
    pub fn new<R: Rng>(
        role: Role,
        my_nick: &str,
        want: Direction,
        encoding: Encoding,
        timeout: u64,
        rng: &mut R,
    ) -> Self {
        Self {
            role,
            state: HandshakeState::Connected,
            encoding,
            my_nick: my_nick.to_string(),
            my_lock: nmdc::make_lock(rng),
            want,
            number: rng.gen_range(1..0x7fff),
            remote_nick: None,
            remote_lock: None,
            remote_direction: None,
            features: None,
            sent_reply: false,
            elapsed: 0,
            timeout,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_nick(&self) -> Option<&str> {
        self.remote_nick.as_deref()
    }

    /// Direction to ask for; may change until our `$Direction` goes out.
    pub fn set_want(&mut self, want: Direction) {
        self.want = want;
    }

    fn frame(&self, command: &str) -> Vec<u8> {
        encode_frame(command, self.encoding)
    }

    /// First frames when we dialed.
    pub fn start(&mut self) -> Vec<Vec<u8>> {
        if self.role != Role::Outgoing || self.state != HandshakeState::Connected {
            return Vec::new();
        }
        vec![
            self.frame(&nmdc::my_nick(&self.my_nick)),
            self.frame(&nmdc::lock(&self.my_lock)),
        ]
    }

    fn reply_frames(&mut self, include_identity: bool) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if include_identity {
            out.push(self.frame(&nmdc::my_nick(&self.my_nick)));
            out.push(self.frame(&nmdc::lock(&self.my_lock)));
        }
        out.push(self.frame(&nmdc::supports(PEER_FEATURES)));
        out.push(self.frame(&nmdc::direction(self.want, self.number)));
        if let Some(lock) = &self.remote_lock {
            out.push(nmdc::key_frame(&nmdc::lock_to_key(lock)));
        }
        self.sent_reply = true;
        out
    }

    fn fail(&mut self, err: HandshakeError) -> Result<Step, HandshakeError> {
        self.state = HandshakeState::Closed;
        Err(err)
    }

    /// Resolve both `$Direction`s into ours.
    fn arbitrate(&self) -> Result<Direction, HandshakeError> {
        let Some((theirs, their_number)) = self.remote_direction else {
            return Err(HandshakeError::Unexpected {
                command: "$Key",
                state: self.state,
            });
        };
        match (self.want, theirs) {
            (Direction::Download, Direction::Upload) => Ok(Direction::Download),
            (Direction::Upload, Direction::Download) => Ok(Direction::Upload),
            (Direction::Download, Direction::Download) if self.number > their_number => {
                Ok(Direction::Download)
            }
            (Direction::Download, Direction::Download) if self.number < their_number => {
                Ok(Direction::Upload)
            }
            (dir, _) => Err(HandshakeError::DirectionConflict(dir)),
        }
    }

    pub fn on_command(&mut self, cmd: PeerCommand) -> Result<Step, HandshakeError> {
        use HandshakeState::*;
        let mut step = Step::default();
        match (self.state, cmd) {
            (Closed, _) => return Err(HandshakeError::Closed),
            (Connected, PeerCommand::MyNick(nick)) if self.remote_nick.is_none() => {
                self.remote_nick = Some(nick.clone());
                step.identified = Some(nick);
            }
            (Connected, PeerCommand::Lock { lock, .. }) if self.remote_nick.is_some() => {
                if !lock.starts_with(EXTENDED_PREFIX.as_bytes()) {
                    return self.fail(HandshakeError::MissingFeature("ADCGet"));
                }
                self.remote_lock = Some(lock);
                self.state = VersionExchanged;
                if self.role == Role::Incoming {
                    step.send = self.reply_frames(true);
                }
            }
            (VersionExchanged, PeerCommand::Supports(list)) => {
                let features = Features::from_list(&list);
                if !features.adcget {
                    return self.fail(HandshakeError::MissingFeature("ADCGet"));
                }
                self.features = Some(features);
            }
            (VersionExchanged, PeerCommand::Direction { direction, number }) => {
                self.remote_direction = Some((direction, number));
            }
            (VersionExchanged, PeerCommand::Key(key)) => {
                if !nmdc::key_matches(&self.my_lock, &key) {
                    return self.fail(HandshakeError::BadKey);
                }
                let Some(features) = self.features else {
                    return self.fail(HandshakeError::MissingFeature("ADCGet"));
                };
                self.state = Authenticated;
                if !self.sent_reply {
                    step.send = self.reply_frames(false);
                }
                let direction = match self.arbitrate() {
                    Ok(d) => d,
                    Err(e) => return self.fail(e),
                };
                let nick = self.remote_nick.clone().unwrap_or_default();
                self.state = Ready;
                step.ready = Some(Negotiated {
                    nick,
                    direction,
                    features,
                });
            }
            (state, other) => {
                let command = match other {
                    PeerCommand::MyNick(_) => "$MyNick",
                    PeerCommand::Lock { .. } => "$Lock",
                    PeerCommand::Supports(_) => "$Supports",
                    PeerCommand::Direction { .. } => "$Direction",
                    PeerCommand::Key(_) => "$Key",
                    PeerCommand::AdcGet(_) => "$ADCGET",
                    PeerCommand::AdcSnd(_) => "$ADCSND",
                    PeerCommand::Error(_) => "$Error",
                    PeerCommand::MaxedOut => "$MaxedOut",
                    PeerCommand::Unknown(_) => return Ok(step),
                };
                return self.fail(HandshakeError::Unexpected { command, state });
            }
        }
        Ok(step)
    }

    /// Count one tick; errors once the handshake has taken too long.
    pub fn tick(&mut self) -> Result<(), HandshakeError> {
        if matches!(self.state, HandshakeState::Ready | HandshakeState::Closed) {
            return Ok(());
        }
        self.elapsed += 1;
        if self.elapsed >= self.timeout {
            let state = self.state;
            self.state = HandshakeState::Closed;
            return Err(HandshakeError::Timeout(state));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmdc::parse_peer_command;
    use crate::wire::{Chunk, FrameBuffer};

    fn make(role: Role, nick: &str, want: Direction) -> PeerHandshake {
        let mut rng = rand::thread_rng();
        PeerHandshake::new(role, nick, want, Encoding::Utf8, 30, &mut rng)
    }

    /// Feed frames into `hs`, collecting everything it sends and any Ready result.
    fn feed(hs: &mut PeerHandshake, frames: Vec<Vec<u8>>) -> Result<(Vec<Vec<u8>>, Option<Negotiated>), HandshakeError> {
        let mut fb = FrameBuffer::new();
        for f in frames {
            fb.push(&f);
        }
        let mut out = Vec::new();
        let mut ready = None;
        while let Some(Chunk::Command(frame)) = fb.next_chunk().unwrap() {
            let cmd = parse_peer_command(&frame, Encoding::Utf8).unwrap();
            let step = hs.on_command(cmd)?;
            out.extend(step.send);
            if step.ready.is_some() {
                ready = step.ready;
            }
        }
        Ok((out, ready))
    }

    fn run(dialer: &mut PeerHandshake, listener: &mut PeerHandshake) -> (Result<Option<Negotiated>, HandshakeError>, Result<Option<Negotiated>, HandshakeError>) {
        let opening = dialer.start();
        let (reply, l_ready) = match feed(listener, opening) {
            Ok(v) => v,
            Err(e) => return (Ok(None), Err(e)),
        };
        let (finish, d_ready) = match feed(dialer, reply) {
            Ok(v) => v,
            Err(e) => return (Err(e), Ok(l_ready)),
        };
        let l_final = feed(listener, finish).map(|(_, r)| r.or(l_ready));
        (Ok(d_ready), l_final)
    }

    #[test]
    fn download_meets_upload() {
        let mut dialer = make(Role::Outgoing, "alice", Direction::Download);
        let mut listener = make(Role::Incoming, "bob", Direction::Upload);
        let (d, l) = run(&mut dialer, &mut listener);
        let d = d.unwrap().unwrap();
        let l = l.unwrap().unwrap();
        assert_eq!(d.nick, "bob");
        assert_eq!(d.direction, Direction::Download);
        assert_eq!(l.nick, "alice");
        assert_eq!(l.direction, Direction::Upload);
        assert!(d.features.tthf && d.features.tthl && d.features.adcget);
        assert_eq!(dialer.state(), HandshakeState::Ready);
        assert_eq!(listener.state(), HandshakeState::Ready);
    }

    #[test]
    fn both_download_higher_number_wins() {
        let mut dialer = make(Role::Outgoing, "alice", Direction::Download);
        let mut listener = make(Role::Incoming, "bob", Direction::Download);
        dialer.number = 100;
        listener.number = 200;
        let (d, l) = run(&mut dialer, &mut listener);
        assert_eq!(d.unwrap().unwrap().direction, Direction::Upload);
        assert_eq!(l.unwrap().unwrap().direction, Direction::Download);
    }

    #[test]
    fn both_upload_conflicts() {
        let mut dialer = make(Role::Outgoing, "alice", Direction::Upload);
        let mut listener = make(Role::Incoming, "bob", Direction::Upload);
        let (d, _) = run(&mut dialer, &mut listener);
        assert_eq!(
            d.unwrap_err(),
            HandshakeError::DirectionConflict(Direction::Upload)
        );
        assert_eq!(dialer.state(), HandshakeState::Closed);
    }

    #[test]
    fn identified_reported_on_my_nick() {
        let mut listener = make(Role::Incoming, "bob", Direction::Upload);
        let step = listener
            .on_command(PeerCommand::MyNick("alice".into()))
            .unwrap();
        assert_eq!(step.identified.as_deref(), Some("alice"));
        assert!(step.send.is_empty());
    }

    #[test]
    fn wrong_key_rejected() {
        let mut listener = make(Role::Incoming, "bob", Direction::Upload);
        listener.on_command(PeerCommand::MyNick("alice".into())).unwrap();
        listener
            .on_command(PeerCommand::Lock {
                lock: b"EXTENDEDPROTOCOLabcdef".to_vec(),
                pk: String::new(),
            })
            .unwrap();
        listener
            .on_command(PeerCommand::Supports(vec!["ADCGet".into()]))
            .unwrap();
        listener
            .on_command(PeerCommand::Direction {
                direction: Direction::Download,
                number: 5,
            })
            .unwrap();
        assert_eq!(
            listener.on_command(PeerCommand::Key(b"garbage".to_vec())).unwrap_err(),
            HandshakeError::BadKey
        );
    }

    #[test]
    fn peer_without_adcget_refused() {
        let mut listener = make(Role::Incoming, "bob", Direction::Upload);
        listener.on_command(PeerCommand::MyNick("old".into())).unwrap();
        listener
            .on_command(PeerCommand::Lock {
                lock: b"EXTENDEDPROTOCOLabcdef".to_vec(),
                pk: String::new(),
            })
            .unwrap();
        assert_eq!(
            listener
                .on_command(PeerCommand::Supports(vec!["XmlBZList".into()]))
                .unwrap_err(),
            HandshakeError::MissingFeature("ADCGet")
        );
    }

    #[test]
    fn out_of_order_command_fails() {
        let mut hs = make(Role::Incoming, "bob", Direction::Upload);
        assert!(matches!(
            hs.on_command(PeerCommand::Key(vec![1, 2, 3])),
            Err(HandshakeError::Unexpected { command: "$Key", .. })
        ));
        assert_eq!(hs.on_command(PeerCommand::MaxedOut).unwrap_err(), HandshakeError::Closed);
    }

    #[test]
    fn timeout_before_ready() {
        let mut hs = make(Role::Outgoing, "alice", Direction::Download);
        hs.start();
        for _ in 0..29 {
            hs.tick().unwrap();
        }
        assert_eq!(
            hs.tick().unwrap_err(),
            HandshakeError::Timeout(HandshakeState::Connected)
        );
        assert_eq!(hs.state(), HandshakeState::Closed);
    }
}
