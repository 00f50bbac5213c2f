/// Change log and replay verification.
///
/// Records every state change maestro emits into an append-only log,
/// hashes it deterministically and exports it in a stable text format, so
/// that two runs (for instance one per context factory) can be compared.

use std::io::{self, BufRead, Write};

use crate::activity::{ActivityId, ActivityKind, Failure};
use crate::actor::ActorId;
use crate::observer::{ChangeKind, ExitKind, Observer, StateChange, Subject};
use crate::platform::HostId;
use crate::time::VirtualTime;

// ── Hash utility ──────────────────────────────────────────────────────

/// Combine two u64 hashes deterministically.
pub fn hash_combine(a: u64, b: u64) -> u64 {
    let mut h = a;
    h = h.wrapping_mul(0x517cc1b727220a95);
    h = h.wrapping_add(b);
    h ^= h >> 32;
    h
}

// ── Change log ────────────────────────────────────────────────────────

/// Append-only log of state changes.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    changes: Vec<StateChange>,
}

impl ChangeLog {
    pub fn new() -> Self {
        ChangeLog {
            changes: Vec::new(),
        }
    }

    pub fn record(&mut self, change: StateChange) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Only the activity completions, in order.
    pub fn completions(&self) -> impl Iterator<Item = &StateChange> {
        self.changes.iter().filter(|c| {
            matches!(
                c.kind,
                ChangeKind::ActivityDone | ChangeKind::ActivityFailed(_) | ChangeKind::ActivityCanceled
            )
        })
    }

    /// Deterministic hash of the whole log.
    pub fn log_hash(&self) -> u64 {
        let mut h: u64 = 0;
        for change in &self.changes {
            h = hash_combine(h, change.at.to_bits());
            h = hash_combine(h, subject_code(&change.subject));
            h = hash_combine(h, kind_code(&change.kind));
        }
        h
    }

    // ── Export / Import ───────────────────────────────────────────

    /// Write the log in a deterministic text format.
    pub fn export<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "# SIMKERNEL CHANGE LOG v1")?;
        writeln!(w, "# changes: {}", self.changes.len())?;
        for change in &self.changes {
            writeln!(
                w,
                "C {:016x} {} {}",
                change.at.to_bits(),
                encode_subject(&change.subject),
                encode_kind(&change.kind)
            )?;
        }
        Ok(())
    }

    pub fn export_to_file(&self, path: &str) -> io::Result<()> {
        let mut f = std::fs::File::create(path)?;
        self.export(&mut f)
    }

    /// Read a log written by [`export`](Self::export).
    pub fn import<R: BufRead>(r: R) -> io::Result<Self> {
        let mut changes = Vec::new();
        for line in r.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let change =
                decode_change(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            changes.push(change);
        }
        Ok(ChangeLog { changes })
    }
}

impl Observer for ChangeLog {
    fn on_change(&mut self, change: &StateChange) {
        self.record(*change);
    }
}

// ── Verification ──────────────────────────────────────────────────────

/// Whether two logs hold the same changes in the same order.
pub fn logs_match(a: &ChangeLog, b: &ChangeLog) -> bool {
    a.changes.len() == b.changes.len()
        && a.changes.iter().zip(&b.changes).all(|(ca, cb)| {
            ca.at.to_bits() == cb.at.to_bits() && ca.subject == cb.subject && ca.kind == cb.kind
        })
}

// ── Encoding helpers ──────────────────────────────────────────────────

fn subject_code(s: &Subject) -> u64 {
    match s {
        Subject::Actor(id) => hash_combine(1, id.raw()),
        Subject::Activity(id) => hash_combine(2, id.raw()),
    }
}

fn kind_code(k: &ChangeKind) -> u64 {
    match k {
        ChangeKind::ActorCreated { host } => hash_combine(1, host.raw() as u64),
        ChangeKind::ActorSuspended => 2,
        ChangeKind::ActorResumed => 3,
        ChangeKind::ActorMigrated { to } => hash_combine(4, to.raw() as u64),
        ChangeKind::ActorKilled => 5,
        ChangeKind::ActorFinished(exit) => hash_combine(6, *exit as u64),
        ChangeKind::ActivityCreated(kind) => hash_combine(7, *kind as u64),
        ChangeKind::ActivityStarted => 8,
        ChangeKind::ActivityDone => 9,
        ChangeKind::ActivityFailed(f) => hash_combine(10, *f as u64),
        ChangeKind::ActivityCanceled => 11,
        ChangeKind::ActivityDestroyed => 12,
        ChangeKind::ActivitySuspended => 13,
        ChangeKind::ActivityResumed => 14,
    }
}

fn encode_subject(s: &Subject) -> String {
    match s {
        Subject::Actor(id) => format!("A {}", id.raw()),
        Subject::Activity(id) => format!("X {}.{}", id.index(), id.generation()),
    }
}

fn encode_kind(k: &ChangeKind) -> String {
    match k {
        ChangeKind::ActorCreated { host } => format!("created {}", host.raw()),
        ChangeKind::ActorSuspended => "suspended".into(),
        ChangeKind::ActorResumed => "resumed".into(),
        ChangeKind::ActorMigrated { to } => format!("migrated {}", to.raw()),
        ChangeKind::ActorKilled => "killed".into(),
        ChangeKind::ActorFinished(exit) => format!(
            "finished {}",
            match exit {
                ExitKind::Normal => "normal",
                ExitKind::Killed => "killed",
                ExitKind::Failed => "failed",
                ExitKind::Panicked => "panicked",
            }
        ),
        ChangeKind::ActivityCreated(kind) => format!("new {}", kind),
        ChangeKind::ActivityStarted => "started".into(),
        ChangeKind::ActivitySuspended => "paused".into(),
        ChangeKind::ActivityResumed => "unpaused".into(),
        ChangeKind::ActivityDone => "done".into(),
        ChangeKind::ActivityFailed(f) => format!(
            "failed {}",
            match f {
                Failure::Host => "host",
                Failure::Transfer => "transfer",
                Failure::Timeout => "timeout",
            }
        ),
        ChangeKind::ActivityCanceled => "canceled".into(),
        ChangeKind::ActivityDestroyed => "destroyed".into(),
    }
}

fn decode_change(line: &str) -> Result<StateChange, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 || parts[0] != "C" {
        return Err(format!("invalid change line: {}", line));
    }
    let bits = u64::from_str_radix(parts[1], 16).map_err(|e| format!("time: {}", e))?;
    let secs = f64::from_bits(bits);
    if secs.is_nan() {
        return Err("time: NaN".into());
    }
    let subject = decode_subject(parts[2], parts[3])?;
    let kind = decode_kind(parts[4], parts.get(5).copied())?;
    Ok(StateChange {
        subject,
        kind,
        at: VirtualTime::new(secs),
    })
}

fn decode_subject(tag: &str, value: &str) -> Result<Subject, String> {
    match tag {
        "A" => value
            .parse()
            .map(|raw| Subject::Actor(ActorId::new(raw)))
            .map_err(|e| format!("actor id: {}", e)),
        "X" => {
            let (index, generation) = value
                .split_once('.')
                .ok_or_else(|| format!("activity id: {}", value))?;
            let index = index.parse().map_err(|e| format!("activity index: {}", e))?;
            let generation = generation
                .parse()
                .map_err(|e| format!("activity generation: {}", e))?;
            Ok(Subject::Activity(ActivityId::new(index, generation)))
        }
        other => Err(format!("unknown subject tag: {}", other)),
    }
}

fn parse_host(arg: Option<&str>) -> Result<HostId, String> {
    arg.ok_or("missing host")?
        .parse()
        .map(HostId::new)
        .map_err(|e| format!("host: {}", e))
}

fn decode_kind(word: &str, arg: Option<&str>) -> Result<ChangeKind, String> {
    Ok(match word {
        "created" => ChangeKind::ActorCreated {
            host: parse_host(arg)?,
        },
        "suspended" => ChangeKind::ActorSuspended,
        "resumed" => ChangeKind::ActorResumed,
        "migrated" => ChangeKind::ActorMigrated {
            to: parse_host(arg)?,
        },
        "killed" => ChangeKind::ActorKilled,
        "finished" => ChangeKind::ActorFinished(match arg {
            Some("normal") => ExitKind::Normal,
            Some("killed") => ExitKind::Killed,
            Some("failed") => ExitKind::Failed,
            Some("panicked") => ExitKind::Panicked,
            other => return Err(format!("exit kind: {:?}", other)),
        }),
        "new" => ChangeKind::ActivityCreated(match arg {
            Some("comm") => ActivityKind::Comm,
            Some("exec") => ActivityKind::Exec,
            other => return Err(format!("activity kind: {:?}", other)),
        }),
        "started" => ChangeKind::ActivityStarted,
        "paused" => ChangeKind::ActivitySuspended,
        "unpaused" => ChangeKind::ActivityResumed,
        "done" => ChangeKind::ActivityDone,
        "failed" => ChangeKind::ActivityFailed(match arg {
            Some("host") => Failure::Host,
            Some("transfer") => Failure::Transfer,
            Some("timeout") => Failure::Timeout,
            other => return Err(format!("failure: {:?}", other)),
        }),
        "canceled" => ChangeKind::ActivityCanceled,
        "destroyed" => ChangeKind::ActivityDestroyed,
        other => return Err(format!("unknown change: {}", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChangeLog {
        let mut log = ChangeLog::new();
        let a = ActorId::new(1);
        let x = ActivityId::new(0, 2);
        let t0 = VirtualTime::ZERO;
        let t1 = VirtualTime::new(1.25);
        for (subject, kind, at) in [
            (Subject::Actor(a), ChangeKind::ActorCreated { host: HostId::new(3) }, t0),
            (Subject::Activity(x), ChangeKind::ActivityCreated(ActivityKind::Comm), t0),
            (Subject::Activity(x), ChangeKind::ActivityStarted, t0),
            (Subject::Activity(x), ChangeKind::ActivitySuspended, t0),
            (Subject::Activity(x), ChangeKind::ActivityResumed, t1),
            (Subject::Activity(x), ChangeKind::ActivityFailed(Failure::Transfer), t1),
            (Subject::Actor(a), ChangeKind::ActorMigrated { to: HostId::new(1) }, t1),
            (Subject::Actor(a), ChangeKind::ActorFinished(ExitKind::Killed), t1),
            (Subject::Activity(x), ChangeKind::ActivityDestroyed, t1),
        ] {
            log.record(StateChange { subject, kind, at });
        }
        log
    }

    #[test]
    fn test_hash_combine_deterministic() {
        assert_eq!(hash_combine(1, 2), hash_combine(1, 2));
        assert_ne!(hash_combine(1, 2), hash_combine(2, 1));
    }

    #[test]
    fn test_log_hash_sensitive_to_order() {
        let log = sample();
        let mut reordered = ChangeLog::new();
        for c in log.changes().iter().rev() {
            reordered.record(*c);
        }
        assert_eq!(sample().log_hash(), log.log_hash());
        assert_ne!(reordered.log_hash(), log.log_hash());
        assert!(!logs_match(&log, &reordered));
    }

    #[test]
    fn test_export_import() {
        let log = sample();
        let mut buf = Vec::new();
        log.export(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("# SIMKERNEL CHANGE LOG v1"));
        assert!(text.contains("X 0.2 failed transfer"));
        assert!(text.contains("X 0.2 paused"));

        let imported = ChangeLog::import(io::BufReader::new(buf.as_slice())).unwrap();
        assert!(logs_match(&log, &imported));
        assert_eq!(imported.log_hash(), log.log_hash());
    }

    #[test]
    fn test_import_rejects_garbage() {
        let r = ChangeLog::import(io::BufReader::new("C zz A 1 killed\n".as_bytes()));
        assert!(r.is_err());
    }

    #[test]
    fn test_completions_filter() {
        let log = sample();
        assert_eq!(log.completions().count(), 1);
    }
}
