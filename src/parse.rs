use anyhow::Result;

pub fn parse_remote_host(input: &str) -> Result<(String, String, u16)> {
    let at_pos =
        input.find('@').ok_or_else(|| anyhow::anyhow!("缺少用户名，例如 user@host[:port]"))?;
    let (user_part, host_part) = input.split_at(at_pos);
    let user = user_part.trim();
    let host_port = &host_part[1..]; // skip '@'
    if user.is_empty() || host_port.is_empty() {
        return Err(anyhow::anyhow!("用户名或主机为空"));
    }

    // 支持 host:port，否则默认 21 — Support host:port, default to 21 if not provided
    let (host, port) = if let Some(colon) = host_port.rfind(':') {
        let (h, p_str) = host_port.split_at(colon);
        let p_str = &p_str[1..]; // skip ':'
        let p: u16 = p_str.parse().map_err(|_| anyhow::anyhow!("端口无效: {}", p_str))?;
        (h.to_string(), p)
    } else {
        (host_port.to_string(), 21)
    };

    Ok((user.to_string(), host, port))
}

pub fn parse_alias_and_path(input: &str) -> Result<(String, String)> {
    if let Some((alias, rest)) = input.split_once(':') {
        let a = alias.trim();
        let p = rest.trim();
        if a.is_empty() || p.is_empty() {
            return Err(anyhow::anyhow!("别名或路径为空"));
        }
        Ok((a.to_string(), p.to_string()))
    } else {
        Err(anyhow::anyhow!("未找到分隔符 ':'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_host_with_default_port() {
        let (user, host, port) = parse_remote_host("joe@ftp.example.com").unwrap();
        assert_eq!((user.as_str(), host.as_str(), port), ("joe", "ftp.example.com", 21));
    }

    #[test]
    fn remote_host_with_explicit_port() {
        let (_, _, port) = parse_remote_host("joe@ftp.example.com:2121").unwrap();
        assert_eq!(port, 2121);
    }

    #[test]
    fn alias_and_path_split_once() {
        let (alias, path) = parse_alias_and_path("box:/in/tray/").unwrap();
        assert_eq!((alias.as_str(), path.as_str()), ("box", "/in/tray/"));
    }

    #[test]
    fn missing_pieces_are_errors() {
        assert!(parse_remote_host("nouser.example.com").is_err());
        assert!(parse_alias_and_path("noseparator").is_err());
        assert!(parse_alias_and_path("alias:").is_err());
    }
}
