use std::future::Future;
use std::sync::Arc;

use url::Url;

/// Consumer-provided user agent the sign-in flow runs in.
///
/// # Example
///
/// ```rust,ignore
/// impl Browser for MyWebView {
///     fn location(&self) -> Url {
///         self.current_url()
///     }
///
///     fn navigate(&self, url: &Url) {
///         self.load(url.as_str());
///     }
///
///     fn replace_location(&self, url: &Url) {
///         self.history_replace(url.as_str());
///     }
///
///     async fn silent_signin(&self, url: Url) -> Result<Url, Box<dyn std::error::Error + Send + Sync>> {
///         // Load `url` in a hidden frame and wait until it reaches the silent redirect URI.
///         self.hidden_frame(url).await
///     }
/// }
/// ```
pub trait Browser: Send + Sync + 'static {
    /// Current location, including query and fragment.
    fn location(&self) -> Url;

    /// Full-page navigation; the current page is left.
    fn navigate(&self, url: &Url);

    /// Replace the current history entry without navigating.
    fn replace_location(&self, url: &Url);

    /// Run a `prompt=none` authorization request without user interaction.
    ///
    /// Returns the location the provider redirected the hidden frame to.
    fn silent_signin(
        &self,
        url: Url,
    ) -> impl Future<Output = Result<Url, Box<dyn std::error::Error + Send + Sync>>> + Send;
}

impl<T: Browser> Browser for Arc<T> {
    fn location(&self) -> Url {
        (**self).location()
    }

    fn navigate(&self, url: &Url) {
        (**self).navigate(url);
    }

    fn replace_location(&self, url: &Url) {
        (**self).replace_location(url);
    }

    fn silent_signin(
        &self,
        url: Url,
    ) -> impl Future<Output = Result<Url, Box<dyn std::error::Error + Send + Sync>>> + Send {
        (**self).silent_signin(url)
    }
}
