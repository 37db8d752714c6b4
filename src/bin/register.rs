//! Registers the application commands with Discord.
//!
//! Usage: cargo run --bin register
//!
//! Reads DISCORD_TOKEN and APPLICATION_ID from the environment and
//! overwrites the global command set: the /ask slash command and the
//! message context command.

use serde_json::json;

// Discord option type 3 = string; command type 3 = message context menu.
fn commands() -> serde_json::Value {
    json!([
        {
            "name": "ask",
            "description": "Ask the AI a question",
            "options": [
                {
                    "type": 3,
                    "name": "question",
                    "description": "The question you want to ask",
                    "required": true
                },
                {
                    "type": 3,
                    "name": "mode",
                    "description": "Select AI personality mode",
                    "required": false,
                    "choices": [
                        {"name": "外交官モード (Diplomat)", "value": "diplomat"},
                        {"name": "変態紳士モード (Pervy Gentleman)", "value": "pervy_gentleman"},
                        {"name": "一般厳粛モード (Strict)", "value": "strict"}
                    ]
                },
                {
                    "type": 3,
                    "name": "model",
                    "description": "Choose a preset free model",
                    "required": false,
                    "choices": [
                        {"name": "Gemini 2.0 Flash Exp (Fastest)", "value": "google/gemini-2.0-flash-exp:free"},
                        {"name": "Llama 3.1 8B (Smart)", "value": "meta-llama/llama-3.1-8b-instruct:free"},
                        {"name": "DeepSeek V3 (Strong)", "value": "deepseek/deepseek-chat:free"},
                        {"name": "Mistral Small 24B", "value": "mistralai/mistral-small-24b-instruct-2501:free"}
                    ]
                },
                {
                    "type": 3,
                    "name": "custom_model",
                    "description": "Enter a custom OpenRouter model ID",
                    "required": false
                }
            ]
        },
        {
            "name": "AIで返信する",
            "type": 3
        }
    ])
}

fn required_env(key: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => {
            eprintln!("{key} is required");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let token = required_env("DISCORD_TOKEN");
    let application_id = required_env("APPLICATION_ID");
    let base_url = std::env::var("DISCORD_BASE_URL")
        .unwrap_or_else(|_| "https://discord.com/api/v10".to_string());

    println!("Registering application commands...");

    let client = reqwest::Client::new();
    let response = client
        .put(format!("{base_url}/applications/{application_id}/commands"))
        .header("Authorization", format!("Bot {token}"))
        .json(&commands())
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            println!("Successfully registered application commands.");
        }
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            eprintln!("registration failed: {status}: {body}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("registration request failed: {e}");
            std::process::exit(1);
        }
    }
}
