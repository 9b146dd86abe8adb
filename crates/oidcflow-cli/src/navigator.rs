use colored::Colorize;
use oidcflow::Navigator;
use url::Url;

/// Prints navigation targets for the user to open in a browser.
#[derive(Debug, Default)]
pub struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn navigate(&self, url: &Url) {
        println!("{}", "Open this URL in your browser:".bold());
        println!("  {url}");
    }

    fn open_silent_renew_frame(&self, url: &Url) {
        // A terminal has no hidden frame; the user completes it like a login.
        println!("{}", "Silent renew needs a browser, open:".bold());
        println!("  {url}");
    }
}
