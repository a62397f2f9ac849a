//! Default value helpers shared by the config types

pub fn any_host() -> String {
    "0.0.0.0".to_string()
}

pub fn local_host() -> String {
    "127.0.0.1".to_string()
}

pub fn dns_ttl() -> u32 {
    300
}

pub fn acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}
