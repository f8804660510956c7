//! Markup injected into the UI document's head

use crate::config::Profile;

/// Browsers only expose `crypto.randomUUID` in secure contexts; the proxy is
/// reached over plain HTTP.
const RANDOM_UUID_POLYFILL: &str = r#"<script>
if (typeof crypto.randomUUID !== 'function') {
  crypto.randomUUID = function() {
    return 'xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx'.replace(/[xy]/g, function(c) {
      var r = Math.random() * 16 | 0, v = c == 'x' ? r : (r & 0x3 | 0x8);
      return v.toString(16);
    });
  };
}
</script>"#;

const MOBILE_VIEWPORT: &str = r#"<meta name="viewport" content="width=device-width, initial-scale=1.0, maximum-scale=1.0, user-scalable=no">"#;

const MOBILE_STYLE: &str = r#"<style>
html, body { touch-action: manipulation; }
* { -webkit-tap-highlight-color: transparent; }
:root {
  --mobile-font-scale: 1.1;
  --mobile-touch-target: 44px;
}
button, input, textarea, [role="button"] {
  min-height: var(--mobile-touch-target) !important;
  font-size: calc(1em * var(--mobile-font-scale)) !important;
}
.message-content, .chat-message, p, span {
  font-size: 16px !important;
  line-height: 1.5 !important;
}
[class*="scroll"], [class*="list"] {
  -webkit-overflow-scrolling: touch;
  scroll-behavior: smooth;
}
.sidebar, .file-explorer, [class*="panel"]:not([class*="chat"]) {
  display: none !important;
}
[class*="chat"], [class*="message"] {
  width: 100% !important;
  max-width: 100vw !important;
}
</style>"#;

/// Assets for a presentation profile, in injection order
pub fn assets_for(profile: Profile) -> String {
    match profile {
        Profile::Desktop => RANDOM_UUID_POLYFILL.to_string(),
        Profile::Mobile => format!("{}{}\n{}", RANDOM_UUID_POLYFILL, MOBILE_STYLE, MOBILE_VIEWPORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_assets() {
        let assets = assets_for(Profile::Desktop);
        assert!(assets.contains("crypto.randomUUID"));
        assert!(!assets.contains("viewport"));
    }

    #[test]
    fn test_mobile_assets() {
        let assets = assets_for(Profile::Mobile);
        assert!(assets.starts_with("<script>"));
        assert!(assets.contains("touch-action"));
        assert!(assets.contains("name=\"viewport\""));
    }
}
