use rust_embed::RustEmbed;

/// Key material and rules files shared by the test suites.
#[derive(RustEmbed)]
#[folder = "data/"]
pub struct Data;
