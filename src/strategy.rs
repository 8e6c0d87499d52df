//! Extraction strategy chain.
//!
//! Upstream sites rate-limit and bot-check each client identity separately,
//! so several anonymous identities are tried before credentials are used.

use std::path::PathBuf;
use std::sync::Arc;

use crate::classifier::{self, ErrorClass, PermanentReason};
use crate::engine::ExtractionEngine;
use crate::error::EngineError;
use crate::models::VideoInfo;

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One client identity presented to the extraction engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StrategyProfile {
    pub name: String,
    /// `youtube:player_client` extractor argument.
    pub player_client: Option<String>,
    pub user_agent: String,
    pub socket_timeout_secs: u32,
    pub extractor_retries: u32,
    pub cookies_file: Option<PathBuf>,
}

impl StrategyProfile {
    fn client(name: &str, player_client: &str, user_agent: &str, socket_timeout_secs: u32) -> Self {
        StrategyProfile {
            name: name.to_string(),
            player_client: Some(player_client.to_string()),
            user_agent: user_agent.to_string(),
            socket_timeout_secs,
            extractor_retries: 1,
            cookies_file: None,
        }
    }

    pub fn android_vr() -> Self {
        Self::client(
            "android_vr",
            "android_vr",
            "com.google.android.apps.youtube.vr.oculus/1.56.21 (Linux; U; Android 12L; eureka-user Build/SQ3A.220605.009.A1) gzip",
            30,
        )
    }

    pub fn ios() -> Self {
        Self::client(
            "ios",
            "ios",
            "com.google.ios.youtube/19.29.1 (iPhone16,2; U; CPU iOS 17_5_1 like Mac OS X;)",
            25,
        )
    }

    pub fn android() -> Self {
        Self::client(
            "android",
            "android",
            "com.google.android.youtube/19.29.37 (Linux; U; Android 14) gzip",
            25,
        )
    }

    pub fn cookies(cookies_file: PathBuf) -> Self {
        StrategyProfile {
            name: "cookies".to_string(),
            player_client: None,
            user_agent: DESKTOP_UA.to_string(),
            socket_timeout_secs: 30,
            extractor_retries: 1,
            cookies_file: Some(cookies_file),
        }
    }

    pub fn default_web(cookies_file: Option<PathBuf>) -> Self {
        StrategyProfile {
            name: "default".to_string(),
            player_client: None,
            user_agent: DESKTOP_UA.to_string(),
            socket_timeout_secs: 30,
            extractor_retries: 2,
            cookies_file,
        }
    }
}

pub fn is_youtube(url: &str) -> bool {
    url.contains("youtube.com") || url.contains("youtu.be")
}

/// Metadata plus the identity that obtained it.
#[derive(Clone, Debug)]
pub struct Extraction {
    pub info: VideoInfo,
    pub profile: StrategyProfile,
}

pub struct StrategyChain {
    engine: Arc<dyn ExtractionEngine>,
    cookies_file: Option<PathBuf>,
}

impl StrategyChain {
    pub fn new(engine: Arc<dyn ExtractionEngine>, cookies_file: Option<PathBuf>) -> Self {
        StrategyChain { engine, cookies_file }
    }

    pub fn engine(&self) -> &Arc<dyn ExtractionEngine> {
        &self.engine
    }

    /// Profiles in priority order. Only YouTube gets the alternate clients.
    pub fn profiles_for(&self, url: &str) -> Vec<StrategyProfile> {
        if !is_youtube(url) {
            return vec![StrategyProfile::default_web(self.cookies_file.clone())];
        }

        let mut profiles = vec![
            StrategyProfile::android_vr(),
            StrategyProfile::ios(),
            StrategyProfile::android(),
        ];
        if let Some(cookies) = &self.cookies_file {
            profiles.push(StrategyProfile::cookies(cookies.clone()));
        }
        profiles.push(StrategyProfile::default_web(self.cookies_file.clone()));
        profiles
    }

    pub async fn extract(&self, url: &str) -> Result<Extraction, EngineError> {
        let mut last_error: Option<String> = None;

        for profile in self.profiles_for(url) {
            tracing::info!(strategy = %profile.name, "Probing {}", url);
            match self.engine.inspect(url, &profile).await {
                Ok(info) if !info.title.is_empty() || !info.formats.is_empty() => {
                    tracing::info!(strategy = %profile.name, "Resolved '{}'", info.title);
                    return Ok(Extraction { info, profile });
                }
                Ok(_) => {
                    tracing::warn!(strategy = %profile.name, "Engine returned no usable metadata");
                    last_error = Some("engine returned no usable metadata".to_string());
                }
                Err(e) => {
                    let text = e.to_string();
                    tracing::warn!(strategy = %profile.name, "Metadata lookup failed: {}", text);
                    if classifier::is_unconditionally_fatal(&text) {
                        return Err(EngineError::Exhausted(format!(
                            "content is private or not available: {}",
                            text
                        )));
                    }
                    last_error = Some(text);
                }
            }
        }

        Err(EngineError::Exhausted(summarize(last_error)))
    }
}

fn summarize(last_error: Option<String>) -> String {
    let Some(last) = last_error else {
        return "could not extract media info, check that the link is correct".to_string();
    };

    let lower = last.to_lowercase();
    if classifier::categorize(&last) == ErrorClass::Permanent(PermanentReason::CredentialsRequired) {
        format!(
            "upstream asked to sign in to confirm this is not a bot; upload valid cookies or retry later (last error: {})",
            last
        )
    } else if lower.contains("timeout") || lower.contains("timed out") {
        format!("network timeout while fetching media info, retry later (last error: {})", last)
    } else {
        format!("all extraction strategies failed, last error: {}", last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ProgressCallback, TransferSpec};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers lookups per profile name; records the order of attempts.
    struct ScriptedEngine {
        answers: HashMap<String, Result<String, String>>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        fn new(answers: &[(&str, Result<&str, &str>)]) -> Self {
            ScriptedEngine {
                answers: answers
                    .iter()
                    .map(|(name, answer)| {
                        (name.to_string(), answer.map(str::to_string).map_err(str::to_string))
                    })
                    .collect(),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExtractionEngine for ScriptedEngine {
        async fn inspect(&self, _url: &str, profile: &StrategyProfile) -> Result<VideoInfo, EngineError> {
            self.attempts.lock().unwrap().push(profile.name.clone());
            match self.answers.get(&profile.name) {
                Some(Ok(title)) => Ok(VideoInfo { title: title.clone(), ..Default::default() }),
                Some(Err(stderr)) => Err(EngineError::Failed { code: Some(1), stderr: stderr.clone() }),
                None => Err(EngineError::Failed { code: Some(1), stderr: "HTTP Error 403".to_string() }),
            }
        }

        async fn fetch(
            &self,
            _url: &str,
            _profile: &StrategyProfile,
            _transfer: &TransferSpec,
            _progress: ProgressCallback<'_>,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    const YT: &str = "https://www.youtube.com/watch?v=abc";

    #[tokio::test]
    async fn falls_through_to_next_profile() {
        let engine = Arc::new(ScriptedEngine::new(&[
            ("android_vr", Err("HTTP Error 403: Forbidden")),
            ("ios", Ok("Demo")),
        ]));
        let chain = StrategyChain::new(engine.clone(), None);

        let extraction = chain.extract(YT).await.unwrap();
        assert_eq!(extraction.info.title, "Demo");
        assert_eq!(extraction.profile.name, "ios");
        assert_eq!(*engine.attempts.lock().unwrap(), vec!["android_vr", "ios"]);
    }

    #[tokio::test]
    async fn private_content_aborts_the_chain() {
        let engine = Arc::new(ScriptedEngine::new(&[("android_vr", Err("ERROR: Private video"))]));
        let chain = StrategyChain::new(engine.clone(), None);

        let err = chain.extract(YT).await.unwrap_err();
        assert!(err.to_string().contains("private"));
        assert_eq!(engine.attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bot_checks_on_every_profile_produce_actionable_summary() {
        let bot = Err("Sign in to confirm you're not a bot");
        let engine = Arc::new(ScriptedEngine::new(&[
            ("android_vr", bot),
            ("ios", bot),
            ("android", bot),
            ("default", bot),
        ]));
        let chain = StrategyChain::new(engine.clone(), None);

        let err = chain.extract(YT).await.unwrap_err().to_string();
        assert!(err.contains("cookies"));
        assert_eq!(
            classifier::categorize(&err),
            ErrorClass::Permanent(PermanentReason::CredentialsRequired)
        );
        assert_eq!(engine.attempts.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn timeout_summary_stays_transient() {
        let engine = Arc::new(ScriptedEngine::new(&[("default", Err("Read timed out"))]));
        let chain = StrategyChain::new(engine, None);

        let err = chain.extract("https://vimeo.com/1").await.unwrap_err().to_string();
        assert!(err.starts_with("network timeout"));
        assert_eq!(classifier::categorize(&err), ErrorClass::Transient);
    }

    #[test]
    fn cookies_profile_only_when_configured() {
        let engine: Arc<dyn ExtractionEngine> = Arc::new(ScriptedEngine::new(&[]));
        let names = |chain: &StrategyChain, url: &str| {
            chain.profiles_for(url).into_iter().map(|p| p.name).collect::<Vec<_>>()
        };

        let anonymous = StrategyChain::new(engine.clone(), None);
        assert_eq!(names(&anonymous, YT), vec!["android_vr", "ios", "android", "default"]);

        let with_cookies = StrategyChain::new(engine, Some(PathBuf::from("/tmp/cookies.txt")));
        assert_eq!(
            names(&with_cookies, YT),
            vec!["android_vr", "ios", "android", "cookies", "default"]
        );
        assert_eq!(names(&with_cookies, "https://vimeo.com/1"), vec!["default"]);
    }
}
