use url::Url;

/// The redirect collaborator.
///
/// Browser hosts change the location or load a hidden frame; headless hosts
/// print the URL or hand it to a system browser.
pub trait Navigator: Send + Sync {
    /// Sends the user agent to `url`.
    fn navigate(&self, url: &Url);

    /// Loads `url` in a hidden frame for a silent renew.
    fn open_silent_renew_frame(&self, url: &Url);
}
