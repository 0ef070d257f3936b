//! Command protocol values and their wire encoding
//!
//! A [`Command`] is an immutable protocol step: kind, option (modifier or
//! placement condition), activity name, activity id, originator id and a
//! typed argument list. The wire form is preserves packed binary produced
//! through the serde bridge, which keeps it self-describing. The typed
//! argument list is kept next to the bytes so handlers never re-decode.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::activity::ActivityId;
use super::error::{CommandError, CommandResult};

/// NAK reason: arguments did not match the template signature
pub const NAK_ILLEGAL_PARAMS: &str = "ILLEGAL-PARAMS";
/// NAK reason: no template (or instance) for the request
pub const NAK_NOT_FOUND: &str = "NOT-FOUND";
/// NAK reason: placement condition excludes the responder
pub const NAK_CONDITION_FALSE: &str = "CONDITION-FALSE";
/// Originator marker on a result reply that carries a value
pub const RESULTS_MARKER: &str = "RESULTS";
/// Originator marker on a result reply without a value
pub const EMPTY_MARKER: &str = "EMPTY";

/// Protocol command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Asynchronous remote execution request
    RexecAsy,
    /// Asynchronous re-execution for missing replies
    RexecAsy2,
    /// Asynchronous request answering a callback
    RexecAsyCbk,
    /// Synchronous remote execution request
    RexecSyn,
    /// Positive acknowledgment
    RexecAck,
    /// Negative acknowledgment (reason in the first argument)
    RexecNak,
    /// Result pull
    RexecResGet,
    /// Result push
    RexecResPut,
    /// Best-effort kill of a remote activity
    RexecKill,
    /// Locally synthesized reply for an elapsed wait
    Timeout,
    /// Activity status query
    Status,
    /// Synchronized-start readiness signal
    Ready,
    /// Synchronized-start release (start time in the option)
    Go,
}

impl CommandKind {
    /// Wire label
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::RexecAsy => "REXEC-ASY",
            CommandKind::RexecAsy2 => "REXEC-ASY2",
            CommandKind::RexecAsyCbk => "REXEC-ASY-CBK",
            CommandKind::RexecSyn => "REXEC-SYN",
            CommandKind::RexecAck => "REXEC-ACK",
            CommandKind::RexecNak => "REXEC-NAK",
            CommandKind::RexecResGet => "REXEC-RES-GET",
            CommandKind::RexecResPut => "REXEC-RES-PUT",
            CommandKind::RexecKill => "REXEC-KIL",
            CommandKind::Timeout => "TIMEOUT",
            CommandKind::Status => "STATUS",
            CommandKind::Ready => "READY",
            CommandKind::Go => "GOGOGO",
        }
    }

    /// Whether this kind travels on the request topic (towards a server)
    pub fn is_request(self) -> bool {
        matches!(
            self,
            CommandKind::RexecAsy
                | CommandKind::RexecAsy2
                | CommandKind::RexecAsyCbk
                | CommandKind::RexecSyn
                | CommandKind::RexecResGet
                | CommandKind::RexecKill
                | CommandKind::Status
                | CommandKind::Ready
        )
    }

    /// Whether this kind asks a server to run an activity asynchronously
    pub fn is_async_request(self) -> bool {
        matches!(
            self,
            CommandKind::RexecAsy | CommandKind::RexecAsy2 | CommandKind::RexecAsyCbk
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "REXEC-ASY" => CommandKind::RexecAsy,
            "REXEC-ASY2" => CommandKind::RexecAsy2,
            "REXEC-ASY-CBK" => CommandKind::RexecAsyCbk,
            "REXEC-SYN" => CommandKind::RexecSyn,
            "REXEC-ACK" => CommandKind::RexecAck,
            "REXEC-NAK" => CommandKind::RexecNak,
            "REXEC-RES-GET" => CommandKind::RexecResGet,
            "REXEC-RES-PUT" => CommandKind::RexecResPut,
            "REXEC-KIL" => CommandKind::RexecKill,
            "TIMEOUT" => CommandKind::Timeout,
            "STATUS" => CommandKind::Status,
            "READY" => CommandKind::Ready,
            "GOGOGO" => CommandKind::Go,
            other => return Err(CommandError::UnknownKind(other.to_string())),
        })
    }
}

/// Activity argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    /// Integer (`i`)
    Int(i64),
    /// Double (`d` or `f`)
    Double(f64),
    /// String (`s`)
    Str(String),
    /// Raw byte buffer (`n`)
    Bytes(Vec<u8>),
}

impl Argument {
    /// Primitive tag of this value
    pub fn arg_type(&self) -> ArgType {
        match self {
            Argument::Int(_) => ArgType::Int,
            Argument::Double(_) => ArgType::Double,
            Argument::Str(_) => ArgType::Str,
            Argument::Bytes(_) => ArgType::Bytes,
        }
    }

    /// Integer value, if this is an int
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Argument::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Double value, if this is a double
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Argument::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// String value, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Argument::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Byte buffer, if this is a byte argument
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Argument::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

/// Primitive argument type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    /// `s`
    Str,
    /// `i`
    Int,
    /// `d` / `f`
    Double,
    /// `n`
    Bytes,
}

impl ArgType {
    fn tag(self) -> char {
        match self {
            ArgType::Str => 's',
            ArgType::Int => 'i',
            ArgType::Double => 'd',
            ArgType::Bytes => 'n',
        }
    }
}

/// Ordered argument signature of an activity template
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature(Vec<ArgType>);

impl Signature {
    /// Parse a signature string, one tag per argument (`s`, `i`, `d`, `f`, `n`)
    pub fn parse(text: &str) -> CommandResult<Self> {
        text.chars()
            .map(|tag| match tag {
                's' => Ok(ArgType::Str),
                'i' => Ok(ArgType::Int),
                'd' | 'f' => Ok(ArgType::Double),
                'n' => Ok(ArgType::Bytes),
                other => Err(CommandError::InvalidSignature {
                    signature: text.to_string(),
                    tag: other,
                }),
            })
            .collect::<CommandResult<Vec<_>>>()
            .map(Self)
    }

    /// Declared types
    pub fn types(&self) -> &[ArgType] {
        &self.0
    }

    /// Number of declared arguments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the signature takes no arguments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Verify that `args` match this signature one-for-one
    pub fn check(&self, args: &[Argument]) -> CommandResult<()> {
        if args.len() != self.0.len() {
            return Err(CommandError::SignatureMismatch(format!(
                "expected {} arguments ({}), got {}",
                self.0.len(),
                self,
                args.len()
            )));
        }
        for (position, (expected, arg)) in self.0.iter().zip(args).enumerate() {
            if arg.arg_type() != *expected {
                return Err(CommandError::SignatureMismatch(format!(
                    "argument {} should be '{}', got '{}'",
                    position,
                    expected.tag(),
                    arg.arg_type().tag()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in &self.0 {
            write!(f, "{}", ty.tag())?;
        }
        Ok(())
    }
}

/// Serialized shape of a command
#[derive(Serialize, Deserialize)]
struct WireCommand {
    kind: String,
    option: String,
    name: String,
    id: String,
    originator: String,
    args: Vec<Argument>,
}

/// Immutable protocol command plus its encoded form
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: CommandKind,
    option: String,
    name: String,
    id: ActivityId,
    originator: String,
    args: Vec<Argument>,
    encoded: Vec<u8>,
}

impl Command {
    /// Build and encode a command
    pub fn new(
        kind: CommandKind,
        option: impl Into<String>,
        name: impl Into<String>,
        id: ActivityId,
        originator: impl Into<String>,
        args: Vec<Argument>,
    ) -> CommandResult<Self> {
        let mut command = Self {
            kind,
            option: option.into(),
            name: name.into(),
            id,
            originator: originator.into(),
            args,
            encoded: Vec::new(),
        };
        command.encoded = command.encode()?;
        Ok(command)
    }

    /// Build a reply for the same activity as `request`
    pub fn reply_to(
        request: &Command,
        kind: CommandKind,
        option: impl Into<String>,
        originator: impl Into<String>,
        args: Vec<Argument>,
    ) -> CommandResult<Self> {
        Self::new(
            kind,
            option,
            request.name.clone(),
            request.id.clone(),
            originator,
            args,
        )
    }

    /// Synthesized TIMEOUT reply for an elapsed wait
    pub fn timeout(name: &str, id: &ActivityId) -> CommandResult<Self> {
        Self::new(CommandKind::Timeout, "", name, id.clone(), "", Vec::new())
    }

    /// Retarget this command under a new kind, keeping its payload
    pub fn rebuild(&self, kind: CommandKind) -> CommandResult<Self> {
        Self::new(
            kind,
            self.option.clone(),
            self.name.clone(),
            self.id.clone(),
            self.originator.clone(),
            self.args.clone(),
        )
    }

    /// Decode a command from its wire form
    pub fn decode(bytes: &[u8]) -> CommandResult<Self> {
        if bytes.is_empty() {
            return Err(CommandError::Malformed("empty payload".to_string()));
        }
        let wire: WireCommand = preserves::serde::from_bytes(bytes)
            .map_err(|e| CommandError::Malformed(e.to_string()))?;
        let kind = wire
            .kind
            .parse()
            .map_err(|e: CommandError| CommandError::Malformed(e.to_string()))?;

        Ok(Self {
            kind,
            option: wire.option,
            name: wire.name,
            id: ActivityId::new(wire.id),
            originator: wire.originator,
            args: wire.args,
            encoded: bytes.to_vec(),
        })
    }

    fn encode(&self) -> CommandResult<Vec<u8>> {
        use preserves::PackedWriter;

        let wire = WireCommand {
            kind: self.kind.as_str().to_string(),
            option: self.option.clone(),
            name: self.name.clone(),
            id: self.id.as_str().to_string(),
            originator: self.originator.clone(),
            args: self.args.clone(),
        };

        let mut buf = Vec::new();
        let mut writer = PackedWriter::new(&mut buf);
        preserves::serde::to_writer(&mut writer, &wire)
            .map_err(|e| CommandError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Command kind
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Option or placement condition
    pub fn option(&self) -> &str {
        &self.option
    }

    /// Activity name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Activity id
    pub fn id(&self) -> &ActivityId {
        &self.id
    }

    /// Originator id (or a result marker on result replies)
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Typed arguments
    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    /// Whether the encoded form is empty (never true for a built command)
    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    /// NAK reason carried in the first argument
    pub fn nak_reason(&self) -> Option<&str> {
        if self.kind != CommandKind::RexecNak {
            return None;
        }
        self.args.first().and_then(Argument::as_str)
    }

    /// Whether this is a result reply carrying a value
    pub fn carries_results(&self) -> bool {
        self.kind == CommandKind::RexecResPut && self.originator == RESULTS_MARKER
    }

    /// Lease in milliseconds advertised by an acknowledgment
    ///
    /// Only replies with exactly one integer argument carry a lease.
    pub fn lease_ms(&self) -> Option<u64> {
        match self.args.as_slice() {
            [Argument::Int(ms)] if *ms >= 0 => Some(*ms as u64),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}#{} from {} ({} args)",
            self.kind,
            self.option,
            self.name,
            self.id,
            self.originator,
            self.args.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Command {
        Command::new(
            CommandKind::RexecAsy,
            "true",
            "add",
            ActivityId::new("42"),
            "dev-1",
            vec![Argument::Int(2), Argument::Int(-3)],
        )
        .unwrap()
    }

    #[test]
    fn test_kind_labels_roundtrip() {
        for kind in [
            CommandKind::RexecAsy,
            CommandKind::RexecAsy2,
            CommandKind::RexecAsyCbk,
            CommandKind::RexecSyn,
            CommandKind::RexecAck,
            CommandKind::RexecNak,
            CommandKind::RexecResGet,
            CommandKind::RexecResPut,
            CommandKind::RexecKill,
            CommandKind::Timeout,
            CommandKind::Status,
            CommandKind::Ready,
            CommandKind::Go,
        ] {
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), kind);
        }
        assert!(matches!(
            "REXEC-FOO".parse::<CommandKind>(),
            Err(CommandError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_signature_parse_and_check() {
        let sig = Signature::parse("sidn").unwrap();
        assert_eq!(sig.len(), 4);
        assert_eq!(sig.to_string(), "sidn");
        assert_eq!(Signature::parse("f").unwrap().types().to_vec(), vec![ArgType::Double]);

        let args = vec![
            Argument::Str("x".into()),
            Argument::Int(1),
            Argument::Double(0.5),
            Argument::Bytes(vec![1, 2]),
        ];
        assert!(sig.check(&args).is_ok());
        assert!(sig.check(&args[..3]).is_err());

        let swapped = vec![
            Argument::Int(1),
            Argument::Str("x".into()),
            Argument::Double(0.5),
            Argument::Bytes(vec![]),
        ];
        assert!(matches!(
            sig.check(&swapped),
            Err(CommandError::SignatureMismatch(_))
        ));
        assert!(matches!(
            Signature::parse("ix"),
            Err(CommandError::InvalidSignature { tag: 'x', .. })
        ));
    }

    #[test]
    fn test_decode_restores_fields() {
        let cmd = sample();
        assert!(!cmd.is_empty());
        assert_eq!(cmd.len(), cmd.as_bytes().len());

        let input = cmd.as_bytes().to_vec();
        let decoded = Command::decode(&input).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(input, cmd.as_bytes());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Command::decode(&[]), Err(CommandError::Malformed(_))));
        assert!(Command::decode(&[0xff, 0x00, 0x13]).is_err());

        let bytes = sample().as_bytes().to_vec();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(Command::decode(truncated).is_err());
    }

    #[test]
    fn test_rebuild_keeps_payload() {
        let ack = Command::new(
            CommandKind::RexecAck,
            "DEVICE",
            "add",
            ActivityId::new("7"),
            "dev-1",
            vec![Argument::Int(25)],
        )
        .unwrap();

        let retry = ack.rebuild(CommandKind::RexecAsy2).unwrap();
        assert_eq!(retry.kind(), CommandKind::RexecAsy2);
        assert_eq!(retry.option(), "DEVICE");
        assert_eq!(retry.id(), ack.id());
        assert_eq!(retry.args(), ack.args());
        assert_ne!(retry.as_bytes(), ack.as_bytes());
    }

    #[test]
    fn test_reply_helpers() {
        let request = sample();
        let nak = Command::reply_to(
            &request,
            CommandKind::RexecNak,
            "FOG",
            "srv",
            vec![Argument::Str(NAK_NOT_FOUND.into())],
        )
        .unwrap();
        assert_eq!(nak.nak_reason(), Some(NAK_NOT_FOUND));
        assert_eq!(nak.id(), request.id());
        assert_eq!(nak.lease_ms(), None);

        let put = Command::reply_to(
            &request,
            CommandKind::RexecResPut,
            "FOG",
            RESULTS_MARKER,
            vec![Argument::Int(5)],
        )
        .unwrap();
        assert!(put.carries_results());
        assert_eq!(put.lease_ms(), Some(5));

        let timeout = Command::timeout("add", request.id()).unwrap();
        assert_eq!(timeout.kind(), CommandKind::Timeout);
        assert!(timeout.args().is_empty());
    }
}
