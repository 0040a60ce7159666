use anyhow::Result;

use crate::EngineError;
use crate::ftp::reply::Reply;

/// Variables available to login scripts. `None` means the value was never
/// supplied; referencing it fails the connect with a prompt-kind error so the
/// host can ask the user.
#[derive(Debug, Clone, Default)]
pub struct ScriptVars {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub account: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
}

impl ScriptVars {
    fn lookup(&self, name: &str) -> Option<String> {
        match name.to_ascii_lowercase().as_str() {
            "host" => self.host.clone(),
            "port" => self.port.map(|p| p.to_string()),
            "user" => self.user.clone(),
            "password" => self.password.clone(),
            "account" => self.account.clone(),
            "proxyhost" => self.proxy_host.clone(),
            "proxyport" => self.proxy_port.map(|p| p.to_string()),
            "proxyuser" => self.proxy_user.clone(),
            "proxypassword" => self.proxy_password.clone(),
            _ => None,
        }
    }
}

/// Substitute `$(name)` references. Unknown or unset variables raise
/// `ScriptVariableMissing` with the variable name for the prompt.
pub fn substitute(template: &str, vars: &ScriptVars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else {
            return Err(EngineError::ScriptSyntax(template.to_string()).into());
        };
        let name = &after[..end];
        let value = vars
            .lookup(name)
            .ok_or_else(|| EngineError::ScriptVariableMissing(name.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// One scripted login step: a command template plus the reply predicate that
/// lets the script continue.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub template: String,
    /// A 3xx reply means "dialog continues" and is acceptable for every step
    /// except the last; 2xx is always acceptable. This mirrors how USER/PASS/
    /// ACCT chains behave.
    pub allow_intermediate: bool,
}

/// A login script: the standard USER/PASS/ACCT chain or a custom proxy macro
/// supplied as one command template per line ('#' starts a comment line).
#[derive(Debug, Clone)]
pub struct LoginScript {
    pub steps: Vec<ScriptStep>,
}

impl LoginScript {
    /// The plain no-proxy login. ACCT is only appended when an account was
    /// configured.
    pub fn standard(with_account: bool) -> Self {
        let mut steps = vec![
            ScriptStep { template: "USER $(user)".into(), allow_intermediate: true },
            ScriptStep { template: "PASS $(password)".into(), allow_intermediate: true },
        ];
        if with_account {
            steps.push(ScriptStep { template: "ACCT $(account)".into(), allow_intermediate: false });
        }
        LoginScript { steps }
    }

    /// Parse a custom script, one command per non-empty line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            steps.push(ScriptStep { template: line.to_string(), allow_intermediate: true });
        }
        if steps.is_empty() {
            return Err(EngineError::ScriptSyntax("empty login script".into()).into());
        }
        if let Some(last) = steps.last_mut() {
            last.allow_intermediate = false;
        }
        Ok(LoginScript { steps })
    }

    /// Drive the script against a command sink. `send` runs one command and
    /// returns the final reply. A 3xx on an intermediate step continues; a
    /// 3xx at the end, or any 4xx/5xx, rejects the login with the verbatim
    /// reply. Steps after a 2xx mid-chain are skipped (a server that needs no
    /// PASS after USER).
    pub fn run<F>(&self, vars: &ScriptVars, mut send: F) -> Result<Reply>
    where
        F: FnMut(&str) -> Result<Reply>,
    {
        let mut last: Option<Reply> = None;
        for (idx, step) in self.steps.iter().enumerate() {
            let cmd = substitute(&step.template, vars)?;
            let reply = send(&cmd)?;
            if reply.is_success() {
                // Some servers short-circuit the chain (no password needed).
                if idx + 1 < self.steps.len() {
                    tracing::debug!("[login] chain satisfied early after step {}", idx + 1);
                }
                return Ok(reply);
            }
            if reply.is_intermediate() && step.allow_intermediate {
                last = Some(reply);
                continue;
            }
            return Err(EngineError::LoginRejected(reply.text.trim_end().to_string()).into());
        }
        // Every step answered 3xx incl. the last one; the dialog never closed.
        let text = last.map(|r| r.text.trim_end().to_string()).unwrap_or_default();
        Err(EngineError::LoginRejected(text).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> ScriptVars {
        ScriptVars {
            host: Some("ftp.example.com".into()),
            port: Some(21),
            user: Some("joe".into()),
            password: Some("secret".into()),
            account: None,
            ..ScriptVars::default()
        }
    }

    fn reply(code: u16) -> Reply {
        Reply { code, text: format!("{} x\r\n", code) }
    }

    #[test]
    fn substitution_fills_variables() {
        let s = substitute("USER $(user)@$(host):$(port)", &vars()).unwrap();
        assert_eq!(s, "USER joe@ftp.example.com:21");
    }

    #[test]
    fn missing_variable_is_a_prompt_error() {
        let err = substitute("ACCT $(account)", &vars()).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::ScriptVariableMissing(name)) => assert_eq!(name, "account"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unterminated_reference_is_syntax_error() {
        assert!(substitute("USER $(user", &vars()).is_err());
    }

    #[test]
    fn standard_login_runs_user_pass() {
        let script = LoginScript::standard(false);
        let mut sent = Vec::new();
        let result = script.run(&vars(), |cmd| {
            sent.push(cmd.to_string());
            Ok(if cmd.starts_with("USER") { reply(331) } else { reply(230) })
        });
        assert!(result.is_ok());
        assert_eq!(sent, vec!["USER joe", "PASS secret"]);
    }

    #[test]
    fn early_success_skips_password() {
        let script = LoginScript::standard(false);
        let mut sent = Vec::new();
        let result = script.run(&vars(), |cmd| {
            sent.push(cmd.to_string());
            Ok(reply(230))
        });
        assert!(result.is_ok());
        assert_eq!(sent, vec!["USER joe"]);
    }

    #[test]
    fn rejection_carries_server_text() {
        let script = LoginScript::standard(false);
        let err = script
            .run(&vars(), |cmd| {
                Ok(if cmd.starts_with("USER") { reply(331) } else { reply(530) })
            })
            .unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::LoginRejected(text)) => assert!(text.starts_with("530")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn custom_proxy_script_parses_and_runs_in_order() {
        let script = LoginScript::parse(
            "# dial through the relay\nUSER $(proxyuser)\nPASS $(proxypassword)\nUSER $(user)@$(host)\nPASS $(password)\n",
        )
        .unwrap();
        let mut v = vars();
        v.proxy_user = Some("relay".into());
        v.proxy_password = Some("relaypw".into());
        let mut sent = Vec::new();
        let result = script.run(&v, |cmd| {
            sent.push(cmd.to_string());
            Ok(if sent.len() == 4 { reply(230) } else { reply(331) })
        });
        assert!(result.is_ok());
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2], "USER joe@ftp.example.com");
    }
}
