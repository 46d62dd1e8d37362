//! Seam for sending the user to the authorization page

use url::Url;

/// Opens an authorization URL for the user.
///
/// A failure here does not abort the login; the caller still waits for the
/// callback so the user can open the URL by hand.
pub trait Browser: Send + Sync {
    fn open(&self, url: &Url) -> std::io::Result<()>;
}

/// The platform's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &Url) -> std::io::Result<()> {
        open::that_detached(url.as_str())
    }
}
