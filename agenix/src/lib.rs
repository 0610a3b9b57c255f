pub mod cmd;
pub mod config;
pub mod edit;
pub mod error;
pub mod rekey;
pub mod rules;
pub mod store;
pub mod types;

use age::armor::{ArmoredReader, ArmoredWriter, Format};

use std::io;
use std::io::prelude::*;

use zeroize::Zeroizing;

pub use error::{Error, Result};
use types::{Identities, RecipientSet};

const CHUNK_SIZE: usize = 64 * 1024;

/// Encrypts `input` to every recipient in the set. Each call draws a fresh
/// file key, so the output differs even for identical input.
pub fn encrypt(
    recipients: &RecipientSet,
    armor: bool,
    input: &mut impl Read,
    output: &mut impl Write,
) -> Result<()> {
    let encryptor =
        age::Encryptor::with_recipients(recipients.to_recipients()?).ok_or(Error::NoRecipients)?;
    let format = if armor {
        Format::AsciiArmor
    } else {
        Format::Binary
    };

    let output = ArmoredWriter::wrap_output(output, format)?;
    let mut writer = encryptor.wrap_output(output)?;
    io::copy(input, &mut writer)?;
    writer.finish()?.finish()?;
    Ok(())
}

/// Decrypts a binary or armored age file with the first identity that
/// unwraps its file key.
pub fn decrypt(
    identities: &Identities,
    input: impl Read,
    output: &mut impl Write,
) -> Result<()> {
    let decryptor = match age::Decryptor::new_buffered(ArmoredReader::new(input))? {
        age::Decryptor::Recipients(d) => d,
        age::Decryptor::Passphrase(_) => {
            return Err(Error::CorruptCiphertext(
                "file is passphrase-encrypted".to_string(),
            ))
        }
    };
    let mut reader = decryptor.decrypt(identities.iter())?;

    let mut buf = Zeroizing::new(vec![0; CHUNK_SIZE]);
    loop {
        let n = match reader.read(&mut buf[..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::from_payload_io(err)),
        };
        output.write_all(&buf[..n])?;
    }
    Ok(())
}

/// Decrypts into a buffer that is wiped when dropped.
pub fn decrypt_to_vec(identities: &Identities, input: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut plaintext = Zeroizing::new(Vec::with_capacity(input.len()));
    decrypt(identities, input, &mut *plaintext)?;
    Ok(plaintext)
}

pub fn encrypt_to_vec(recipients: &RecipientSet, armor: bool, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut ciphertext = Vec::with_capacity(plaintext.len() + 256);
    encrypt(recipients, armor, &mut &plaintext[..], &mut ciphertext)?;
    Ok(ciphertext)
}
