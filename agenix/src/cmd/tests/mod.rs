use super::Opts;
use crate::config::{Config, NIX_INSTANTIATE};
use crate::error::Error;

use std::fs::{self, File};
use std::io;
use std::io::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

struct Data {
    tmp_dir: TempDir,
    home: PathBuf,
    alice: PathBuf,
    bob: PathBuf,
    user1: PathBuf,
    passwordfile: PathBuf,
    rules: PathBuf,
    scratch: PathBuf,
}

fn fixture(name: &str) -> Vec<u8> {
    testdata::Data::get(name).unwrap().data.into_owned()
}

fn public_key(name: &str) -> String {
    String::from_utf8(fixture(name)).unwrap().trim().to_string()
}

fn setup() -> io::Result<Data> {
    let tmp_dir = TempDir::new()?;
    let tmp_path = tmp_dir.path();
    let home = tmp_path.join("home");
    let alice = tmp_path.join("alice.txt");
    let bob = tmp_path.join("bob.txt");
    let user1 = tmp_path.join("user1_ed25519");
    let passwordfile = tmp_path.join("passwordfile.age");
    let rules = tmp_path.join("secrets.json");
    let scratch = tmp_path.join("scratch");
    fs::create_dir_all(home.join(".ssh"))?;
    fs::create_dir(&scratch)?;
    File::create(&alice)?.write_all(&fixture("age/alice.txt"))?;
    File::create(&bob)?.write_all(&fixture("age/bob.txt"))?;
    File::create(&user1)?.write_all(&fixture("ssh/user1_ed25519"))?;
    let json = format!(
        r#"{{
            "passwordfile.age": {{"publicKeys": ["{}", "{}"]}},
            "armored.age": {{"publicKeys": ["{}"], "armor": true}},
            "typo.age": {{"publicKeys": ["{}", "age1typo"]}}
        }}"#,
        public_key("age/alice.pub"),
        public_key("ssh/user1_ed25519.pub"),
        public_key("age/alice.pub"),
        public_key("age/alice.pub"),
    );
    File::create(&rules)?.write_all(json.as_bytes())?;
    Ok(Data {
        tmp_dir,
        home,
        alice,
        bob,
        user1,
        passwordfile,
        rules,
        scratch,
    })
}

fn config(data: &Data, identities: &[&PathBuf], editor: &str) -> Config {
    Config {
        rules: data.rules.clone(),
        identities: identities.iter().map(|p| p.to_path_buf()).collect(),
        editor: Some(editor.to_string()),
        interactive: false,
        home: Some(data.home.clone()),
        nix_instantiate: NIX_INSTANTIATE.to_string(),
        scratch_dir: Some(data.scratch.clone()),
    }
}

fn decrypt(data: &Data, identities: &[&PathBuf]) -> crate::Result<String> {
    let mut buf = vec![];
    super::decrypt(&data.passwordfile, &config(data, identities, "true"), &mut buf)?;
    Ok(String::from_utf8(buf).unwrap())
}

#[test]
fn test_edit_then_decrypt() -> io::Result<()> {
    let data = setup()?;
    super::run(
        &Opts::Edit(data.passwordfile.clone()),
        &config(&data, &[], "printf secret1234 >"),
    )
    .unwrap();
    assert_eq!(decrypt(&data, &[&data.alice]).unwrap(), "secret1234");
    assert_eq!(decrypt(&data, &[&data.user1]).unwrap(), "secret1234");
    assert!(matches!(
        decrypt(&data, &[&data.bob]).unwrap_err().kind(),
        Error::NoMatchingIdentity
    ));
    assert_eq!(fs::read_dir(&data.scratch)?.count(), 0);
    data.tmp_dir.close()
}

#[test]
fn test_default_identity() -> io::Result<()> {
    let data = setup()?;
    super::run(
        &Opts::Edit(data.passwordfile.clone()),
        &config(&data, &[], "printf hello >"),
    )
    .unwrap();
    fs::copy(&data.user1, data.home.join(".ssh/id_ed25519"))?;
    assert_eq!(decrypt(&data, &[]).unwrap(), "hello");
    data.tmp_dir.close()
}

#[test]
fn test_bogus_default_identity() -> io::Result<()> {
    let data = setup()?;
    super::run(
        &Opts::Edit(data.passwordfile.clone()),
        &config(&data, &[], "printf hello >"),
    )
    .unwrap();
    fs::write(data.home.join(".ssh/id_rsa"), "bogus\n")?;

    let err = super::run(
        &Opts::Edit(data.passwordfile.clone()),
        &config(&data, &[], "printf changed >"),
    )
    .unwrap_err();
    assert!(matches!(err.kind(), Error::InvalidIdentity { .. }));

    super::run(
        &Opts::Edit(data.passwordfile.clone()),
        &config(&data, &[&data.alice], "printf changed >"),
    )
    .unwrap();
    assert_eq!(decrypt(&data, &[&data.alice]).unwrap(), "changed");
    data.tmp_dir.close()
}

#[test]
fn test_rekey() -> io::Result<()> {
    let data = setup()?;
    super::run(
        &Opts::Edit(data.passwordfile.clone()),
        &config(&data, &[], "printf secret1234 >"),
    )
    .unwrap();
    let before = fs::read(&data.passwordfile)?;
    super::run(&Opts::Rekey(vec![]), &config(&data, &[&data.user1], "true")).unwrap();
    assert_ne!(fs::read(&data.passwordfile)?, before);
    assert_eq!(decrypt(&data, &[&data.alice]).unwrap(), "secret1234");
    data.tmp_dir.close()
}

#[test]
fn test_armored_secret() -> io::Result<()> {
    let data = setup()?;
    let armored = data.tmp_dir.path().join("armored.age");
    super::run(&Opts::Edit(armored.clone()), &config(&data, &[], "printf x >")).unwrap();
    let mut contents = String::new();
    File::open(&armored)?.read_to_string(&mut contents)?;
    assert!(contents.starts_with("-----BEGIN AGE ENCRYPTED FILE-----"));
    data.tmp_dir.close()
}

#[test]
fn test_unknown_secret() -> io::Result<()> {
    let data = setup()?;
    let other = data.tmp_dir.path().join("other.age");
    let err = super::run(&Opts::Edit(other), &config(&data, &[], "true")).unwrap_err();
    assert!(matches!(err.kind(), Error::UnknownSecret));
    assert_eq!(err.exit_code(), 6);
    data.tmp_dir.close()
}

#[test]
fn test_decrypt_missing_file() -> io::Result<()> {
    let data = setup()?;
    let err = decrypt(&data, &[&data.alice]).unwrap_err();
    assert!(matches!(err.kind(), Error::Io(_)));
    data.tmp_dir.close()
}

#[test]
fn test_bad_recipient_only_blocks_encryption() -> io::Result<()> {
    let data = setup()?;
    let typo = data.tmp_dir.path().join("typo.age");
    let alice_only = crate::types::RecipientSet::parse(&[public_key("age/alice.pub")]).unwrap();
    fs::write(&typo, crate::encrypt_to_vec(&alice_only, false, b"still readable").unwrap())?;

    let mut buf = vec![];
    super::decrypt(&typo, &config(&data, &[&data.alice], "true"), &mut buf).unwrap();
    assert_eq!(buf, b"still readable");

    let before = fs::read(&typo)?;
    let err = super::run(&Opts::Edit(typo.clone()), &config(&data, &[&data.alice], "true"))
        .unwrap_err();
    assert!(matches!(err.kind(), Error::InvalidRecipient { .. }));
    assert_eq!(err.exit_code(), 3);
    let err = super::run(&Opts::Rekey(vec![typo.clone()]), &config(&data, &[&data.alice], "true"))
        .unwrap_err();
    assert!(matches!(err.kind(), Error::InvalidRecipient { .. }));
    assert_eq!(fs::read(&typo)?, before);
    data.tmp_dir.close()
}

#[test]
fn test_parse_actions() {
    use clap::Parser;
    let cli = super::Cli::try_parse_from(["agenix", "-r", "-i", "key.txt", "a.age"]).unwrap();
    assert_eq!(cli.opts(), Some(Opts::Rekey(vec![PathBuf::from("a.age")])));
    assert_eq!(cli.config().identities, vec![PathBuf::from("key.txt")]);

    let cli = super::Cli::try_parse_from(["agenix", "-e", "a.age", "--scratch-dir", "/tmp/x"]).unwrap();
    assert_eq!(cli.config().scratch_dir, Some(PathBuf::from("/tmp/x")));

    let cli = super::Cli::try_parse_from(["agenix"]).unwrap();
    assert_eq!(cli.opts(), None);

    assert!(super::Cli::try_parse_from(["agenix", "-e", "a.age", "-d", "a.age"]).is_err());
    assert!(super::Cli::try_parse_from(["agenix", "a.age"]).is_err());
}
