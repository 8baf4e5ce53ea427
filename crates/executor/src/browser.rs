//! Browser selection for TestCafe runs

/// Browser used when a request does not name one
pub const DEFAULT_BROWSER: &str = "chrome:headless";

/// Chrome flags that keep headless runs stable inside containers
const HEADLESS_CHROME_FLAGS: &[&str] = &[
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-software-rasterizer",
    "--disable-extensions",
    "--disable-setuid-sandbox",
    "--single-process",
    "--disable-background-networking",
    "--disable-default-apps",
    "--disable-sync",
    "--metrics-recording-only",
    "--mute-audio",
    "--no-first-run",
    "--safebrowsing-disable-auto-update",
    "--disable-web-security",
];

/// Last resort when every preferred headless browser failed
const HEADLESS_FALLBACK: &str = "chrome:headless --no-sandbox --disable-dev-shm-usage";

/// How browser candidates are chosen for a run
#[derive(Debug, Clone)]
pub struct BrowserPolicy {
    /// Browser used when the request leaves it empty
    pub default_browser: String,

    /// Only ever launch headless browsers (servers, containers)
    pub force_headless: bool,

    /// Try further browsers when the requested one cannot start
    pub fallback: bool,
}

impl Default for BrowserPolicy {
    fn default() -> Self {
        Self {
            default_browser: DEFAULT_BROWSER.to_string(),
            force_headless: false,
            fallback: true,
        }
    }
}

impl BrowserPolicy {
    /// Ordered, de-duplicated list of browser configurations to attempt
    pub fn candidates(&self, requested: Option<&str>) -> Vec<String> {
        let requested = requested.map(str::trim).filter(|r| !r.is_empty());

        if !self.fallback {
            return vec![requested.unwrap_or(&self.default_browser).to_string()];
        }

        let mut list: Vec<String> = Vec::new();

        if self.force_headless {
            if self.default_browser.contains("chrome") {
                let mut chrome = vec!["chrome:headless"];
                chrome.extend_from_slice(HEADLESS_CHROME_FLAGS);
                list.push(chrome.join(" "));
            } else if self.default_browser.contains("edge") {
                list.push("edge:headless".to_string());
            } else {
                list.push(self.default_browser.clone());
            }
            list.push(HEADLESS_FALLBACK.to_string());
            return dedup(list);
        }

        if cfg!(windows) {
            list.push("edge:headless".to_string());
            list.push("edge".to_string());
        }
        let req = requested.unwrap_or(&self.default_browser);
        list.push(req.to_string());
        if !req.contains(':') {
            list.push(format!("{}:headless", req));
        }
        for fallback in ["chrome:headless", "chrome", "firefox:headless", "firefox"] {
            list.push(fallback.to_string());
        }

        dedup(list)
    }
}

/// Drop repeated entries, keeping first occurrences in order
fn dedup(list: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(list.len());
    for item in list {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
