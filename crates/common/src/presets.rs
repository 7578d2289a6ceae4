//! Built-in email client catalog
//!
//! Each preset encodes a real-world capability and automation matrix. Together they are
//! the default seed data for a fresh store.

use std::collections::BTreeMap;

use crate::client::{
    AutomationConfig, BrowserKind, ClientCapabilities, ClientType, CreateEmailClient,
    EmailClient, Platform, RenderingEngine, TestConfig,
};
use crate::types::{ImageFormat, Viewport};
use crate::Result;

/// Ids of every preset, in catalog order
pub const PRESET_IDS: &[&str] = &[
    "gmail",
    "outlook-web",
    "outlook-2019",
    "yandex",
    "mailru",
    "apple-mail",
];

/// Build every preset client
pub fn all() -> Result<Vec<EmailClient>> {
    Ok(vec![
        gmail()?,
        outlook_web()?,
        outlook_2019()?,
        yandex_mail()?,
        mail_ru()?,
        apple_mail()?,
    ])
}

/// Build the preset with `id`, if there is one
pub fn by_id(id: &str) -> Result<Option<EmailClient>> {
    let client = match id {
        "gmail" => gmail()?,
        "outlook-web" => outlook_web()?,
        "outlook-2019" => outlook_2019()?,
        "yandex" => yandex_mail()?,
        "mailru" => mail_ru()?,
        "apple-mail" => apple_mail()?,
        _ => return Ok(None),
    };
    Ok(Some(client))
}

fn web_formats() -> Vec<ImageFormat> {
    vec![
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Gif,
        ImageFormat::Webp,
    ]
}

fn tags(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Gmail in a desktop browser
pub fn gmail() -> Result<EmailClient> {
    EmailClient::create(CreateEmailClient {
        id: "gmail".to_string(),
        name: "gmail".to_string(),
        display_name: "Gmail".to_string(),
        vendor: "Google".to_string(),
        version: None,
        client_type: ClientType::Web,
        platform: Platform::Web,
        rendering_engine: RenderingEngine::Blink,
        market_share: Some(27.8),
        capabilities: ClientCapabilities {
            dark_mode: true,
            responsive_design: true,
            css3: true,
            web_fonts: false,
            flexbox: true,
            grid: true,
            animations: true,
            custom_properties: false,
            accessibility_features: true,
            supported_image_formats: web_formats(),
            max_width: None,
            max_height: None,
            video_support: false,
        },
        test_config: TestConfig {
            priority: 10,
            timeout_ms: 30_000,
            retries: 3,
            screenshot_delay_ms: 1_500,
            load_wait_ms: 3_000,
            ..TestConfig::default()
        },
        automation_config: AutomationConfig::Browser {
            browser: BrowserKind::Chromium,
            headless: true,
            args: vec![
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ],
            user_agent: None,
        },
        tags: tags(&["popular", "webmail", "google"]),
        description: Some("Gmail web client rendered in Chromium".to_string()),
    })
}

/// Outlook on the web (outlook.com / Microsoft 365)
pub fn outlook_web() -> Result<EmailClient> {
    EmailClient::create(CreateEmailClient {
        id: "outlook-web".to_string(),
        name: "outlook-web".to_string(),
        display_name: "Outlook.com".to_string(),
        vendor: "Microsoft".to_string(),
        version: None,
        client_type: ClientType::Web,
        platform: Platform::Web,
        rendering_engine: RenderingEngine::Blink,
        market_share: Some(4.2),
        capabilities: ClientCapabilities {
            dark_mode: true,
            responsive_design: true,
            css3: true,
            web_fonts: false,
            flexbox: true,
            grid: false,
            animations: false,
            custom_properties: false,
            accessibility_features: true,
            supported_image_formats: web_formats(),
            max_width: None,
            max_height: None,
            video_support: false,
        },
        test_config: TestConfig {
            priority: 8,
            ..TestConfig::default()
        },
        automation_config: AutomationConfig::Browser {
            browser: BrowserKind::Chromium,
            headless: true,
            args: vec!["--no-sandbox".to_string()],
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36 Edg/120.0"
                    .to_string(),
            ),
        },
        tags: tags(&["webmail", "microsoft"]),
        description: Some(
            "Outlook on the web rendered in Chromium with an Edge user agent".to_string(),
        ),
    })
}

/// Outlook 2019 for Windows, which renders with the Word engine
pub fn outlook_2019() -> Result<EmailClient> {
    EmailClient::create(CreateEmailClient {
        id: "outlook-2019".to_string(),
        name: "outlook-2019".to_string(),
        display_name: "Outlook 2019".to_string(),
        vendor: "Microsoft".to_string(),
        version: Some("2019".to_string()),
        client_type: ClientType::Desktop,
        platform: Platform::Windows,
        rendering_engine: RenderingEngine::Word,
        market_share: Some(6.5),
        capabilities: ClientCapabilities {
            dark_mode: true,
            responsive_design: false,
            css3: false,
            web_fonts: false,
            flexbox: false,
            grid: false,
            animations: false,
            custom_properties: false,
            accessibility_features: false,
            supported_image_formats: vec![ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Gif],
            max_width: Some(800),
            max_height: None,
            video_support: false,
        },
        test_config: TestConfig {
            priority: 9,
            timeout_ms: 90_000,
            retries: 2,
            screenshot_delay_ms: 3_000,
            load_wait_ms: 10_000,
            viewports: vec![
                Viewport::new("desktop", 800, 1000).as_default(),
                Viewport::new("reading-pane", 600, 800),
            ],
            ..TestConfig::default()
        },
        automation_config: AutomationConfig::Vm {
            template: "win10-outlook-2019".to_string(),
            snapshot: Some("clean-profile".to_string()),
            setup_commands: vec![
                "powershell -File C:\\mailproof\\reset-profile.ps1".to_string(),
                "start outlook.exe /safe:1".to_string(),
            ],
            teardown_commands: vec!["taskkill /IM outlook.exe /F".to_string()],
        },
        tags: tags(&["desktop", "microsoft", "word-engine"]),
        description: Some("Outlook 2019 on Windows 10, driven inside a VM".to_string()),
    })
}

/// Yandex Mail web client
pub fn yandex_mail() -> Result<EmailClient> {
    let mut environment = BTreeMap::new();
    environment.insert("LANG".to_string(), "ru_RU.UTF-8".to_string());
    environment.insert("MAIL_HOST".to_string(), "mail.yandex.ru".to_string());

    EmailClient::create(CreateEmailClient {
        id: "yandex".to_string(),
        name: "yandex".to_string(),
        display_name: "Yandex Mail".to_string(),
        vendor: "Yandex".to_string(),
        version: None,
        client_type: ClientType::Web,
        platform: Platform::Web,
        rendering_engine: RenderingEngine::Blink,
        market_share: Some(1.6),
        capabilities: ClientCapabilities {
            dark_mode: true,
            responsive_design: true,
            css3: true,
            web_fonts: true,
            flexbox: true,
            grid: false,
            animations: true,
            custom_properties: false,
            accessibility_features: false,
            supported_image_formats: web_formats(),
            max_width: None,
            max_height: None,
            video_support: false,
        },
        test_config: TestConfig {
            priority: 5,
            timeout_ms: 45_000,
            ..TestConfig::default()
        },
        automation_config: AutomationConfig::Docker {
            image: "mailproof/yandex-renderer".to_string(),
            tag: "latest".to_string(),
            environment,
        },
        tags: tags(&["webmail", "regional", "ru"]),
        description: Some(
            "Yandex Mail rendered in a containerized browser with a Russian locale".to_string(),
        ),
    })
}

/// Mail.ru web client
pub fn mail_ru() -> Result<EmailClient> {
    let mut environment = BTreeMap::new();
    environment.insert("LANG".to_string(), "ru_RU.UTF-8".to_string());
    environment.insert("MAIL_HOST".to_string(), "e.mail.ru".to_string());

    EmailClient::create(CreateEmailClient {
        id: "mailru".to_string(),
        name: "mailru".to_string(),
        display_name: "Mail.ru".to_string(),
        vendor: "VK".to_string(),
        version: None,
        client_type: ClientType::Web,
        platform: Platform::Web,
        rendering_engine: RenderingEngine::Blink,
        market_share: Some(1.1),
        capabilities: ClientCapabilities {
            dark_mode: true,
            responsive_design: true,
            css3: true,
            web_fonts: false,
            flexbox: true,
            grid: false,
            animations: false,
            custom_properties: false,
            accessibility_features: false,
            supported_image_formats: vec![ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Gif],
            max_width: None,
            max_height: None,
            video_support: false,
        },
        test_config: TestConfig {
            priority: 4,
            timeout_ms: 45_000,
            ..TestConfig::default()
        },
        automation_config: AutomationConfig::Docker {
            image: "mailproof/mailru-renderer".to_string(),
            tag: "latest".to_string(),
            environment,
        },
        tags: tags(&["webmail", "regional", "ru"]),
        description: Some("Mail.ru rendered in a containerized browser".to_string()),
    })
}

/// Apple Mail on macOS
pub fn apple_mail() -> Result<EmailClient> {
    EmailClient::create(CreateEmailClient {
        id: "apple-mail".to_string(),
        name: "apple-mail".to_string(),
        display_name: "Apple Mail".to_string(),
        vendor: "Apple".to_string(),
        version: Some("16".to_string()),
        client_type: ClientType::Desktop,
        platform: Platform::Macos,
        rendering_engine: RenderingEngine::Webkit,
        market_share: Some(35.0),
        capabilities: ClientCapabilities {
            dark_mode: true,
            responsive_design: true,
            css3: true,
            web_fonts: true,
            flexbox: true,
            grid: true,
            animations: true,
            custom_properties: true,
            accessibility_features: true,
            supported_image_formats: web_formats(),
            max_width: None,
            max_height: None,
            video_support: true,
        },
        test_config: TestConfig {
            priority: 9,
            timeout_ms: 60_000,
            screenshot_delay_ms: 2_000,
            load_wait_ms: 5_000,
            viewports: vec![
                Viewport::new("desktop", 1024, 768).as_default().with_dpr(2.0),
                Viewport::new("narrow", 600, 800).with_dpr(2.0),
            ],
            ..TestConfig::default()
        },
        automation_config: AutomationConfig::Vm {
            template: "macos-sonoma-mail".to_string(),
            snapshot: Some("mail-configured".to_string()),
            setup_commands: vec![
                "osascript /opt/mailproof/reset-mailbox.scpt".to_string(),
                "open -a Mail".to_string(),
            ],
            teardown_commands: vec!["osascript -e 'quit app \"Mail\"'".to_string()],
        },
        tags: tags(&["desktop", "apple", "popular"]),
        description: Some("Apple Mail on macOS, driven inside a VM".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WorkerType;

    #[test]
    fn test_all_presets_are_valid_and_unique() {
        let clients = all().unwrap();
        assert_eq!(clients.len(), PRESET_IDS.len());
        for (client, id) in clients.iter().zip(PRESET_IDS) {
            assert_eq!(client.id(), *id);
            client.validate().unwrap();
        }
    }

    #[test]
    fn test_gmail_preset() {
        let gmail = gmail().unwrap();
        assert_eq!(gmail.client_type(), ClientType::Web);
        assert_eq!(gmail.platform(), Platform::Web);
        let score = gmail.compatibility_score();
        assert!((75..=100).contains(&score), "score {score}");
        assert_eq!(score, 88);
        assert!(gmail.is_high_priority());
        assert_eq!(gmail.worker_type(), WorkerType::Browser);
    }

    #[test]
    fn test_every_worker_type_is_represented() {
        let clients = all().unwrap();
        for worker in [WorkerType::Docker, WorkerType::Vm, WorkerType::Browser] {
            assert!(clients.iter().any(|c| c.worker_type() == worker), "{worker}");
        }
        assert!(outlook_2019().unwrap().requires_vm());
        assert!(yandex_mail().unwrap().can_use_container());
    }

    #[test]
    fn test_by_id() {
        assert_eq!(by_id("mailru").unwrap().unwrap().display_name(), "Mail.ru");
        assert!(by_id("hotmail-2003").unwrap().is_none());
    }

    #[test]
    fn test_outlook_desktop_is_word_engine() {
        let outlook = outlook_2019().unwrap();
        assert_eq!(outlook.rendering_engine(), RenderingEngine::Word);
        assert!(!outlook.is_responsive_capable());
        assert_eq!(outlook.compatibility_score(), 13);
        assert_eq!(outlook.default_viewport().width, 800);
    }
}
