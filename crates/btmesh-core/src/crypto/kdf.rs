//! Mesh-specific key derivation functions: s1, k1, k2, k3, k4.

use super::cmac::aes_cmac;

const ZERO_KEY: [u8; 16] = [0u8; 16];

/// `s1(M) = AES-CMAC(ZERO128, M)`
pub fn s1(m: &[u8]) -> [u8; 16] {
    aes_cmac(&ZERO_KEY, m)
}

/// `k1(N, SALT, P) = AES-CMAC(AES-CMAC(SALT, N), P)`
pub fn k1(n: &[u8], salt: &[u8; 16], p: &[u8]) -> [u8; 16] {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// Output of `k2`: NID (low 7 bits), encryption key, privacy key.
pub struct K2Output {
    pub nid: u8,
    pub encryption_key: [u8; 16],
    pub privacy_key: [u8; 16],
}

/// `k2(N, P)` per the network-key-material derivation (NIST SP 800-108
/// counter-mode construction specialised by the mesh profile: T0 = empty,
/// T(i) = AES-CMAC(T, T(i-1) || P || i)).
pub fn k2(n: &[u8; 16], p: &[u8]) -> K2Output {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, n);

    let mut t1_input = Vec::with_capacity(p.len() + 1);
    t1_input.extend_from_slice(p);
    t1_input.push(0x01);
    let t1 = aes_cmac(&t, &t1_input);

    let mut t2_input = Vec::with_capacity(16 + p.len() + 1);
    t2_input.extend_from_slice(&t1);
    t2_input.extend_from_slice(p);
    t2_input.push(0x02);
    let t2 = aes_cmac(&t, &t2_input);

    let mut t3_input = Vec::with_capacity(16 + p.len() + 1);
    t3_input.extend_from_slice(&t2);
    t3_input.extend_from_slice(p);
    t3_input.push(0x03);
    let t3 = aes_cmac(&t, &t3_input);

    let nid = t1[15] & 0x7F;
    K2Output {
        nid,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// `k3(N) = AES-CMAC(s1("smk3"), N || "id64" || 0x01)[8..16]`, returned as
/// a big-endian 64-bit integer.
pub fn k3(n: &[u8; 16]) -> u64 {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, n);
    let mut input = Vec::with_capacity(16 + 5);
    input.extend_from_slice(&t);
    input.extend_from_slice(b"id64");
    input.push(0x01);
    let out = aes_cmac(&t, &input);
    u64::from_be_bytes(out[8..16].try_into().unwrap())
}

/// `k4(N) = AES-CMAC(s1("smk4"), N || "id6" || 0x01)[15] & 0x3F`
pub fn k4(n: &[u8; 16]) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, n);
    let mut input = Vec::with_capacity(16 + 4);
    input.extend_from_slice(&t);
    input.extend_from_slice(b"id6");
    input.push(0x01);
    let out = aes_cmac(&t, &input);
    out[15] & 0x3F
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_from_hex(s: &str) -> [u8; 16] {
        let v = hex::decode(s).unwrap();
        let mut out = [0u8; 16];
        out.copy_from_slice(&v);
        out
    }

    #[test]
    fn k2_derivation_vector() {
        let n = key_from_hex("7dd7364cd842ad18c17c2b820c84c3d6");
        let out = k2(&n, &[0x00]);
        assert_eq!(out.nid, 0x68);
        assert_eq!(hex::encode(out.encryption_key), "0953fa93e7caac9638f58820220a398e");
        assert_eq!(hex::encode(out.privacy_key), "8b84eedec100067d670971dd2aa700cf");
    }

    #[test]
    fn k4_is_six_bits() {
        let n = key_from_hex("3216d1509884b533248541792b877f98");
        let aid = k4(&n);
        assert!(aid <= 0x3F);
    }

    #[test]
    fn k3_network_id_is_deterministic() {
        let n = key_from_hex("7dd7364cd842ad18c17c2b820c84c3d6");
        assert_eq!(k3(&n), k3(&n));
    }
}
