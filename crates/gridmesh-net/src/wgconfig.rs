//! `wg-quick` config for a client outside the mesh.

use ipnet::Ipv4Net;

pub const PERSISTENT_KEEPALIVE: u16 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WireGuard transport address of the external subnet.
    pub address: Ipv4Net,
    pub private_key: String,
    /// Public key of the access node.
    pub peer_public_key: String,
    pub allowed_ips: Vec<Ipv4Net>,
    /// `ip:port` of the access node.
    pub endpoint: String,
}

impl ClientConfig {
    pub fn render(&self) -> String {
        let allowed = self
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "[Interface]\n\
             Address = {}\n\
             PrivateKey = {}\n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = {}\n\
             PersistentKeepalive = {}\n\
             Endpoint = {}\n",
            self.address,
            self.private_key,
            self.peer_public_key,
            allowed,
            PERSISTENT_KEEPALIVE,
            self.endpoint
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_ini_sections() {
        let config = ClientConfig {
            address: "100.64.1.4/32".parse().unwrap(),
            private_key: "cHJpdg==".to_string(),
            peer_public_key: "cHVi".to_string(),
            allowed_ips: vec![
                "10.1.0.0/16".parse().unwrap(),
                "100.64.0.0/16".parse().unwrap(),
            ],
            endpoint: "185.1.2.3:4567".to_string(),
        };
        let text = config.render();
        let expected = "[Interface]
Address = 100.64.1.4/32
PrivateKey = cHJpdg==
[Peer]
PublicKey = cHVi
AllowedIPs = 10.1.0.0/16, 100.64.0.0/16
PersistentKeepalive = 25
Endpoint = 185.1.2.3:4567
";
        assert_eq!(text, expected);
    }
}
