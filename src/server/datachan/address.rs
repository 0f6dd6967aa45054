//! Textual host-port forms exchanged on the control channel: the `h1,h2,h3,h4,p1,p2` form of
//! PORT and PASV (RFC 959) and the `|proto|addr|port|` form of EPRT and EPSV (RFC 2428).

use super::error::{DataChanError, DataChanErrorKind};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

/// Formats an address the way a 227 reply carries it: `h1,h2,h3,h4,p1,p2`.
pub fn encode_host_port(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    let [p1, p2] = addr.port().to_be_bytes();
    format!("{h1},{h2},{h3},{h4},{p1},{p2}")
}

/// Parses the argument of a PORT command. Exactly six comma separated numbers in the range 0-255
/// are accepted. Surrounding parentheses, as some clients echo them from the PASV reply, are
/// ignored.
pub fn decode_host_port(arg: &str) -> Result<SocketAddr, DataChanError> {
    let arg = arg.trim().trim_start_matches('(').trim_end_matches(')');
    let mut bytes = [0u8; 6];
    let mut count = 0;
    for token in arg.split(',') {
        if count == bytes.len() {
            return Err(invalid(format!("too many elements in '{arg}'")));
        }
        bytes[count] = token
            .trim()
            .parse::<u8>()
            .map_err(|_| invalid(format!("'{token}' is not a number between 0 and 255")))?;
        count += 1;
    }
    if count != bytes.len() {
        return Err(invalid(format!("expected 6 elements in '{arg}'")));
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// The text of a 229 reply's address part: `|||port|`.
pub fn encode_extended_port(port: u16) -> String {
    format!("|||{port}|")
}

/// Parses the argument of an EPRT command, for example `|1|132.235.1.2|6275|` or
/// `|2|1080::8:800:200C:417A|5282|`. The first character is the delimiter.
pub fn decode_extended_host_port(arg: &str) -> Result<SocketAddr, DataChanError> {
    let arg = arg.trim();
    let delimiter = arg.chars().next().ok_or_else(|| invalid("empty EPRT argument"))?;
    let parts: Vec<&str> = arg.split(delimiter).collect();
    // "|1|addr|port|" splits into ["", "1", "addr", "port", ""]
    let [_, proto, addr, port, rest] = parts.as_slice() else {
        return Err(invalid(format!("malformed EPRT argument '{arg}'")));
    };
    if !rest.is_empty() {
        return Err(invalid(format!("trailing data in EPRT argument '{arg}'")));
    }
    let ip: IpAddr = match *proto {
        "1" => addr.parse::<Ipv4Addr>().map(IpAddr::V4),
        "2" => addr.parse::<Ipv6Addr>().map(IpAddr::V6),
        other => return Err(invalid(format!("unknown network protocol '{other}'"))),
    }
    .map_err(|e| DataChanError::new(DataChanErrorKind::InvalidTarget, e))?;
    let port: u16 = port.parse().map_err(|_| invalid(format!("'{port}' is not a port")))?;
    Ok(SocketAddr::new(ip, port))
}

fn invalid(msg: impl Into<String>) -> DataChanError {
    DataChanError::new(DataChanErrorKind::InvalidTarget, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_pasv_address() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 60000);
        assert_eq!(encode_host_port(addr), "192,168,1,10,234,96");
    }

    #[test]
    fn decodes_port_argument() {
        let addr = decode_host_port("127,0,0,1,4,1").unwrap();
        assert_eq!(addr, "127.0.0.1:1025".parse::<SocketAddr>().unwrap());
        assert_eq!(decode_host_port("(10,0,0,2,0,21)").unwrap().port(), 21);
    }

    #[test]
    fn rejects_malformed_port_argument() {
        for bad in ["", "1,2,3,4,5", "1,2,3,4,5,6,7", "256,0,0,1,0,21", "a,b,c,d,e,f", "1,2,3,4,5,-6"] {
            let err = decode_host_port(bad).unwrap_err();
            assert_eq!(err.kind(), DataChanErrorKind::InvalidTarget, "input '{}'", bad);
        }
    }

    #[test]
    fn extended_forms() {
        assert_eq!(encode_extended_port(2121), "|||2121|");
        assert_eq!(
            decode_extended_host_port("|1|132.235.1.2|6275|").unwrap(),
            "132.235.1.2:6275".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            decode_extended_host_port("!2!1080::8:800:200C:417A!5282!").unwrap(),
            "[1080::8:800:200C:417A]:5282".parse::<SocketAddr>().unwrap()
        );
        assert!(decode_extended_host_port("|3|1.2.3.4|21|").is_err());
        assert!(decode_extended_host_port("|1|1.2.3.4|21").is_err());
    }
}
