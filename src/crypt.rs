use crate::error::MumbleError;
use crate::proto::mumble::CryptSetup;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use bytes::{BufMut, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use std::time::Instant;

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

/// Bytes prepended to every encrypted datagram: one nonce byte and the first
/// three bytes of the authentication tag.
pub const HEADER_SIZE: usize = 4;

/// OCB2-AES128 state for one client's UDP flow.
///
/// The server encrypts with `encrypt_nonce` and decrypts client packets with
/// `decrypt_nonce`; both advance one step per packet. `decrypt_history` is a
/// 256-slot replay window keyed by the low nonce byte.
pub struct CryptState {
    cipher: Aes128,
    key: [u8; KEY_SIZE],
    encrypt_nonce: [u8; BLOCK_SIZE],
    decrypt_nonce: [u8; BLOCK_SIZE],
    decrypt_history: [u8; 0x100],
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
    pub last_good: Instant,
}

impl CryptState {
    pub fn generate() -> Result<Self, MumbleError> {
        let rand = SystemRandom::new();

        let mut key = [0u8; KEY_SIZE];
        let mut encrypt_nonce = [0u8; BLOCK_SIZE];
        let mut decrypt_nonce = [0u8; BLOCK_SIZE];

        rand.fill(&mut key)?;
        rand.fill(&mut encrypt_nonce)?;
        rand.fill(&mut decrypt_nonce)?;

        Ok(Self {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
            key,
            encrypt_nonce,
            decrypt_nonce,
            decrypt_history: [0u8; 0x100],
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
            last_good: Instant::now(),
        })
    }

    #[cfg(test)]
    fn with_parameters(key: [u8; KEY_SIZE], encrypt_nonce: [u8; BLOCK_SIZE], decrypt_nonce: [u8; BLOCK_SIZE]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
            key,
            encrypt_nonce,
            decrypt_nonce,
            decrypt_history: [0u8; 0x100],
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
            last_good: Instant::now(),
        }
    }

    /// Regenerates the key and both nonces, invalidating the previous context
    /// entirely.
    pub fn reset(&mut self) -> Result<(), MumbleError> {
        let rand = SystemRandom::new();

        rand.fill(&mut self.key)?;
        rand.fill(&mut self.encrypt_nonce)?;
        rand.fill(&mut self.decrypt_nonce)?;

        self.cipher = Aes128::new(GenericArray::from_slice(&self.key));
        self.decrypt_history = [0u8; 0x100];
        self.good = 0;
        self.late = 0;
        self.lost = 0;
        self.resync += 1;

        Ok(())
    }

    /// Client-driven resync: adopt the nonce the client reports for its
    /// encrypt direction.
    pub fn set_decrypt_nonce(&mut self, nonce: &[u8]) -> Result<(), MumbleError> {
        if nonce.len() != BLOCK_SIZE {
            return Err(MumbleError::CryptInit);
        }

        self.decrypt_nonce.copy_from_slice(nonce);
        self.resync += 1;

        Ok(())
    }

    pub fn get_crypt_setup(&self) -> CryptSetup {
        let mut crypt_setup = CryptSetup::new();
        crypt_setup.set_key(self.key.to_vec());
        crypt_setup.set_client_nonce(self.decrypt_nonce.to_vec());
        crypt_setup.set_server_nonce(self.encrypt_nonce.to_vec());

        crypt_setup
    }

    pub fn encrypt(&mut self, plain: &[u8], dest: &mut BytesMut) {
        for i in 0..BLOCK_SIZE {
            self.encrypt_nonce[i] = self.encrypt_nonce[i].wrapping_add(1);

            if self.encrypt_nonce[i] != 0 {
                break;
            }
        }

        let (encrypted, tag) = self.ocb_encrypt(plain, self.encrypt_nonce);

        dest.reserve(HEADER_SIZE + encrypted.len());
        dest.put_u8(self.encrypt_nonce[0]);
        dest.put_slice(&tag.to_be_bytes()[..3]);
        dest.put_slice(&encrypted);
    }

    pub fn decrypt(&mut self, source: &[u8]) -> Result<BytesMut, MumbleError> {
        if source.len() < HEADER_SIZE {
            return Err(MumbleError::Decrypt);
        }

        let ivbyte = source[0];
        let saved_nonce = self.decrypt_nonce;
        let mut restore = false;

        if self.decrypt_nonce[0].wrapping_add(1) == ivbyte {
            // In order.
            if ivbyte > self.decrypt_nonce[0] {
                self.decrypt_nonce[0] = ivbyte;
            } else if ivbyte < self.decrypt_nonce[0] {
                // Low byte wrapped, carry into the rest.
                self.decrypt_nonce[0] = ivbyte;
                increment_tail(&mut self.decrypt_nonce);
            } else {
                return Err(MumbleError::Decrypt);
            }
        } else {
            // Out of order or repeat.
            let mut diff = i32::from(ivbyte) - i32::from(self.decrypt_nonce[0]);

            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if ivbyte < self.decrypt_nonce[0] && (-30..0).contains(&diff) {
                self.late += 1;
                self.lost = self.lost.wrapping_sub(1);
                self.decrypt_nonce[0] = ivbyte;
                restore = true;
            } else if ivbyte > self.decrypt_nonce[0] && (-30..0).contains(&diff) {
                // Late packet from before the low byte wrapped.
                self.late += 1;
                self.lost = self.lost.wrapping_sub(1);
                self.decrypt_nonce[0] = ivbyte;
                decrement_tail(&mut self.decrypt_nonce);
                restore = true;
            } else if ivbyte > self.decrypt_nonce[0] && diff > 0 {
                self.lost += u32::from(ivbyte) - u32::from(self.decrypt_nonce[0]) - 1;
                self.decrypt_nonce[0] = ivbyte;
            } else if ivbyte < self.decrypt_nonce[0] && diff > 0 {
                self.lost += 256 - u32::from(self.decrypt_nonce[0]) + u32::from(ivbyte) - 1;
                self.decrypt_nonce[0] = ivbyte;
                increment_tail(&mut self.decrypt_nonce);
            } else {
                return Err(MumbleError::Decrypt);
            }

            if self.decrypt_history[self.decrypt_nonce[0] as usize] == self.decrypt_nonce[1] {
                self.decrypt_nonce = saved_nonce;
                return Err(MumbleError::Decrypt);
            }
        }

        let (plain, tag) = self.ocb_decrypt(&source[HEADER_SIZE..], self.decrypt_nonce);

        if tag.to_be_bytes()[..3] != source[1..4] {
            self.decrypt_nonce = saved_nonce;
            return Err(MumbleError::Decrypt);
        }

        self.decrypt_history[self.decrypt_nonce[0] as usize] = self.decrypt_nonce[1];

        if restore {
            self.decrypt_nonce = saved_nonce;
        }

        self.good += 1;
        self.last_good = Instant::now();

        Ok(plain)
    }

    fn aes_encrypt(&self, block: u128) -> u128 {
        let mut bytes = GenericArray::from(block.to_be_bytes());
        self.cipher.encrypt_block(&mut bytes);

        u128::from_be_bytes(bytes.into())
    }

    fn aes_decrypt(&self, block: u128) -> u128 {
        let mut bytes = GenericArray::from(block.to_be_bytes());
        self.cipher.decrypt_block(&mut bytes);

        u128::from_be_bytes(bytes.into())
    }

    fn ocb_encrypt(&self, plain: &[u8], nonce: [u8; BLOCK_SIZE]) -> (Vec<u8>, u128) {
        let mut delta = self.aes_encrypt(u128::from_be_bytes(nonce));
        let mut checksum = 0u128;
        let mut encrypted = vec![0u8; plain.len()];

        let mut offset = 0;
        let mut remaining = plain.len();

        while remaining > BLOCK_SIZE {
            delta = s2(delta);

            let block = u128::from_be_bytes(plain[offset..offset + BLOCK_SIZE].try_into().expect("full block"));
            let cipher_block = delta ^ self.aes_encrypt(delta ^ block);

            encrypted[offset..offset + BLOCK_SIZE].copy_from_slice(&cipher_block.to_be_bytes());
            checksum ^= block;

            offset += BLOCK_SIZE;
            remaining -= BLOCK_SIZE;
        }

        delta = s2(delta);

        let pad = self.aes_encrypt(delta ^ (remaining as u128 * 8));

        let mut block_bytes = pad.to_be_bytes();
        block_bytes[..remaining].copy_from_slice(&plain[offset..]);

        let block = u128::from_be_bytes(block_bytes);
        checksum ^= block;

        let cipher_block = block ^ pad;
        encrypted[offset..].copy_from_slice(&cipher_block.to_be_bytes()[..remaining]);

        let tag = self.aes_encrypt(s3(delta) ^ checksum);

        (encrypted, tag)
    }

    fn ocb_decrypt(&self, encrypted: &[u8], nonce: [u8; BLOCK_SIZE]) -> (BytesMut, u128) {
        let mut delta = self.aes_encrypt(u128::from_be_bytes(nonce));
        let mut checksum = 0u128;
        let mut plain = BytesMut::with_capacity(encrypted.len());

        let mut offset = 0;
        let mut remaining = encrypted.len();

        while remaining > BLOCK_SIZE {
            delta = s2(delta);

            let block = u128::from_be_bytes(encrypted[offset..offset + BLOCK_SIZE].try_into().expect("full block"));
            let plain_block = delta ^ self.aes_decrypt(delta ^ block);

            plain.put_slice(&plain_block.to_be_bytes());
            checksum ^= plain_block;

            offset += BLOCK_SIZE;
            remaining -= BLOCK_SIZE;
        }

        delta = s2(delta);

        let pad = self.aes_encrypt(delta ^ (remaining as u128 * 8));

        let mut block_bytes = [0u8; BLOCK_SIZE];
        block_bytes[..remaining].copy_from_slice(&encrypted[offset..]);

        let block = u128::from_be_bytes(block_bytes) ^ pad;
        checksum ^= block;

        plain.put_slice(&block.to_be_bytes()[..remaining]);

        let tag = self.aes_encrypt(s3(delta) ^ checksum);

        (plain, tag)
    }
}

/// Doubling in GF(2^128) with the OCB reduction polynomial.
fn s2(block: u128) -> u128 {
    let carry = block >> 127;

    (block << 1) ^ (carry * 0x87)
}

fn s3(block: u128) -> u128 {
    s2(block) ^ block
}

fn increment_tail(nonce: &mut [u8; BLOCK_SIZE]) {
    for byte in nonce.iter_mut().skip(1) {
        *byte = byte.wrapping_add(1);

        if *byte != 0 {
            break;
        }
    }
}

fn decrement_tail(nonce: &mut [u8; BLOCK_SIZE]) {
    for byte in nonce.iter_mut().skip(1) {
        let previous = *byte;
        *byte = previous.wrapping_sub(1);

        if previous != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The peer for a server state: key shared, nonce directions crossed.
    fn peer_of(state: &CryptState) -> CryptState {
        CryptState::with_parameters(state.key, state.decrypt_nonce, state.encrypt_nonce)
    }

    #[test]
    fn round_trip() {
        let mut server = CryptState::generate().unwrap();
        let mut client = peer_of(&server);

        for len in [0usize, 1, 15, 16, 17, 32, 100, 1000] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();

            let mut wire = BytesMut::new();
            server.encrypt(&plain, &mut wire);
            assert_eq!(wire.len(), HEADER_SIZE + len);

            let decrypted = client.decrypt(&wire).unwrap();
            assert_eq!(decrypted.as_ref(), plain.as_slice());
        }

        assert_eq!(client.good, 8);
        assert_eq!(client.late, 0);
        assert_eq!(client.lost, 0);
    }

    #[test]
    fn replay_is_rejected() {
        let mut server = CryptState::generate().unwrap();
        let mut client = peer_of(&server);

        let mut wire = BytesMut::new();
        server.encrypt(b"voice", &mut wire);

        assert!(client.decrypt(&wire).is_ok());
        assert!(client.decrypt(&wire).is_err());
    }

    #[test]
    fn tampered_tag_is_rejected_and_state_recovers() {
        let mut server = CryptState::generate().unwrap();
        let mut client = peer_of(&server);

        let mut first = BytesMut::new();
        server.encrypt(b"first", &mut first);

        let mut tampered = first.clone();
        tampered[HEADER_SIZE] ^= 0xFF;

        assert!(client.decrypt(&tampered).is_err());

        // The nonce was restored, so the untouched packet still decrypts.
        assert_eq!(client.decrypt(&first).unwrap().as_ref(), b"first");
    }

    #[test]
    fn late_packet_within_window_decrypts() {
        // Pinned nonces: low bytes start at zero so no wrap branch is taken,
        // and the second nonce byte is nonzero so the fresh replay window
        // cannot shadow the late packet.
        let key = [7u8; KEY_SIZE];
        let server_nonce = [0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let client_nonce = [0, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

        let mut server = CryptState::with_parameters(key, server_nonce, client_nonce);
        let mut client = CryptState::with_parameters(key, client_nonce, server_nonce);

        let mut first = BytesMut::new();
        server.encrypt(b"one", &mut first);
        let mut second = BytesMut::new();
        server.encrypt(b"two", &mut second);

        assert_eq!(client.decrypt(&second).unwrap().as_ref(), b"two");
        assert_eq!(client.lost, 1);

        assert_eq!(client.decrypt(&first).unwrap().as_ref(), b"one");
        assert_eq!(client.late, 1);
        assert_eq!(client.good, 2);
    }

    #[test]
    fn wrong_key_fails() {
        let mut server = CryptState::generate().unwrap();
        let mut stranger = CryptState::generate().unwrap();

        let mut wire = BytesMut::new();
        server.encrypt(b"voice", &mut wire);

        assert!(stranger.decrypt(&wire).is_err());
    }

    #[test]
    fn reset_invalidates_previous_setup() {
        let mut state = CryptState::generate().unwrap();

        let before = state.get_crypt_setup();
        state.reset().unwrap();
        let after = state.get_crypt_setup();

        assert_ne!(before.get_key(), after.get_key());
        assert_ne!(before.get_client_nonce(), after.get_client_nonce());
        assert_ne!(before.get_server_nonce(), after.get_server_nonce());
        assert_eq!(state.resync, 1);
    }
}
