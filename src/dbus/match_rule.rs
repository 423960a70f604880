use {
    crate::dbus::{
        BUS_INTERFACE, BUS_NAME,
        bus::{NAME_ACQUIRED, NAME_LOST},
        subscriptions::Signal,
    },
    std::fmt::{Display, Formatter, Write},
    thiserror::Error,
};


#[derive(Debug, Error, Eq, PartialEq)]
pub enum MatchRuleError {
    #[error("Match rule contains an unterminated quoted string")]
    UnterminatedQuote,
    #[error("Match rule element `{0}` is not of the form key=value")]
    MissingValue(String),
    #[error("Match rule key `{0}` is not supported")]
    UnsupportedKey(String),
    #[error("Match rule matches messages of type `{0}` instead of signals")]
    NotASignal(String),
}

/// A structural filter for signals. `None` fields match anything.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub arg0: Option<String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn arg0(mut self, arg0: &str) -> Self {
        self.arg0 = Some(arg0.to_string());
        self
    }

    /// Returns whether the bus delivers matching signals without an
    /// `AddMatch` registration.
    ///
    /// `NameAcquired` and `NameLost` are always sent to the connection they
    /// concern.
    pub fn is_self_delivered(&self) -> bool {
        self.sender.as_deref() == Some(BUS_NAME)
            && self.interface.as_deref() == Some(BUS_INTERFACE)
            && matches!(self.member.as_deref(), Some(NAME_ACQUIRED | NAME_LOST))
    }

    /// The sender by which matching signals can be looked up.
    ///
    /// Signals carry the unique name of their sender. A rule naming a
    /// well-known sender can therefore not be indexed and is checked against
    /// the remaining fields only.
    pub fn sender_key(&self) -> Option<&str> {
        match self.sender.as_deref() {
            Some(s) if s.starts_with(':') || s == BUS_NAME => Some(s),
            _ => None,
        }
    }

    pub fn matches(&self, signal: &Signal) -> bool {
        if let Some(sender) = self.sender_key() {
            if signal.sender.as_deref() != Some(sender) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if &signal.interface != interface {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if &signal.member != member {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if signal.path.as_str() != path {
                return false;
            }
        }
        if let Some(arg0) = &self.arg0 {
            match signal.body.first().and_then(|v| v.as_str()) {
                Some(s) if s == arg0 => {}
                _ => return false,
            }
        }
        true
    }

    /// Parses the string form used by `AddMatch`.
    pub fn parse(s: &str) -> Result<Self, MatchRuleError> {
        let mut rule = Self::default();
        for (key, value) in split_rule(s)? {
            let field = match key.as_str() {
                "type" => {
                    if value != "signal" {
                        return Err(MatchRuleError::NotASignal(value));
                    }
                    continue;
                }
                "sender" => &mut rule.sender,
                "interface" => &mut rule.interface,
                "member" => &mut rule.member,
                "path" => &mut rule.path,
                "arg0" => &mut rule.arg0,
                _ => return Err(MatchRuleError::UnsupportedKey(key)),
            };
            *field = Some(value);
        }
        Ok(rule)
    }
}

fn split_rule(s: &str) -> Result<Vec<(String, String)>, MatchRuleError> {
    let mut res = vec![];
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut key = String::new();
        let mut value = String::new();
        let mut have_eq = false;
        let mut quoted = false;
        while let Some(c) = chars.next() {
            if !have_eq {
                match c {
                    '=' => have_eq = true,
                    ',' => break,
                    c => key.push(c),
                }
                continue;
            }
            match c {
                '\'' => quoted = !quoted,
                '\\' if !quoted && chars.peek() == Some(&'\'') => {
                    chars.next();
                    value.push('\'');
                }
                ',' if !quoted => break,
                c => value.push(c),
            }
        }
        if quoted {
            return Err(MatchRuleError::UnterminatedQuote);
        }
        let key = key.trim().to_string();
        if !have_eq {
            if key.is_empty() {
                continue;
            }
            return Err(MatchRuleError::MissingValue(key));
        }
        res.push((key, value));
    }
    Ok(res)
}

fn write_value(f: &mut Formatter<'_>, key: &str, value: &str) -> std::fmt::Result {
    write!(f, ",{}='", key)?;
    for c in value.chars() {
        match c {
            '\'' => f.write_str(r"'\''")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('\'')
}

/// Renders the rule in the form expected by `AddMatch`.
impl Display for MatchRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("type='signal'")?;
        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("arg0", &self.arg0),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                write_value(f, key, value)?;
            }
        }
        Ok(())
    }
}
