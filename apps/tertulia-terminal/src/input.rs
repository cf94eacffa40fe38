//! Parsing of typed input lines into front-end actions.

use std::{error::Error, fmt};

use tertulia_core::MediaKind;

pub const HELP_TEXT: &str = "\
/join <sala>                  entrar en una sala
/rooms                        listar salas
/retry <id>                   reintentar un mensaje no enviado
/media <kind> <url> [texto]   enviar image, video, audio o file
/leave                        salir de la sala
/help                         esta ayuda
/quit                         cerrar sesión
cualquier otro texto se envía a la sala activa";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    Join(String),
    ListRooms,
    Retry(String),
    Media {
        kind: MediaKind,
        url: String,
        caption: Option<String>,
    },
    Leave,
    Help,
    Quit,
    Send(String),
    /// Blank line.
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    MissingArgument {
        command: &'static str,
        usage: &'static str,
    },
    UnknownMediaKind(String),
    UnknownCommand(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArgument { command, usage } => write!(f, "usage: /{command} {usage}"),
            Self::UnknownMediaKind(kind) => {
                write!(f, "unknown media kind '{kind}' (image, video, audio, file)")
            }
            Self::UnknownCommand(command) => write!(f, "unknown command '/{command}', try /help"),
        }
    }
}

impl Error for InputError {}

pub fn parse_line(line: &str) -> Result<InputAction, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(InputAction::Nothing);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(InputAction::Send(line.to_owned()));
    };

    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (rest, ""),
    };
    match command {
        "join" => required(args, "join", "<sala>").map(InputAction::Join),
        "rooms" => Ok(InputAction::ListRooms),
        "retry" => required(args, "retry", "<id>").map(InputAction::Retry),
        "media" => parse_media(args),
        "leave" => Ok(InputAction::Leave),
        "help" => Ok(InputAction::Help),
        "quit" | "exit" => Ok(InputAction::Quit),
        other => Err(InputError::UnknownCommand(other.to_owned())),
    }
}

fn required(args: &str, command: &'static str, usage: &'static str) -> Result<String, InputError> {
    if args.is_empty() {
        Err(InputError::MissingArgument { command, usage })
    } else {
        Ok(args.to_owned())
    }
}

fn parse_media(args: &str) -> Result<InputAction, InputError> {
    const USAGE: &str = "<kind> <url> [texto]";
    let mut parts = args.splitn(3, char::is_whitespace);
    let (Some(kind), Some(url)) = (
        parts.next().filter(|part| !part.is_empty()),
        parts.next().filter(|part| !part.is_empty()),
    ) else {
        return Err(InputError::MissingArgument {
            command: "media",
            usage: USAGE,
        });
    };
    let caption = parts
        .next()
        .map(str::trim)
        .filter(|caption| !caption.is_empty())
        .map(str::to_owned);

    Ok(InputAction::Media {
        kind: parse_media_kind(kind)?,
        url: url.to_owned(),
        caption,
    })
}

fn parse_media_kind(raw: &str) -> Result<MediaKind, InputError> {
    match raw.to_ascii_lowercase().as_str() {
        "image" | "imagen" => Ok(MediaKind::Image),
        "video" => Ok(MediaKind::Video),
        "audio" => Ok(MediaKind::Audio),
        "file" | "archivo" => Ok(MediaKind::File),
        _ => Err(InputError::UnknownMediaKind(raw.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_sent_trimmed() {
        assert_eq!(
            parse_line("  hola a todos  ").expect("text should parse"),
            InputAction::Send("hola a todos".into())
        );
        assert_eq!(parse_line("   ").expect("blank"), InputAction::Nothing);
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            parse_line("/join  España ").expect("join"),
            InputAction::Join("España".into())
        );
        assert_eq!(
            parse_line("/retry opt-1234").expect("retry"),
            InputAction::Retry("opt-1234".into())
        );
        assert_eq!(parse_line("/rooms").expect("rooms"), InputAction::ListRooms);
        assert_eq!(parse_line("/leave").expect("leave"), InputAction::Leave);
        assert_eq!(parse_line("/quit").expect("quit"), InputAction::Quit);
        assert_eq!(parse_line("/exit").expect("exit"), InputAction::Quit);
    }

    #[test]
    fn missing_arguments_report_usage() {
        let err = parse_line("/join").expect_err("join without room must fail");
        assert_eq!(err.to_string(), "usage: /join <sala>");
        assert!(parse_line("/retry   ").is_err());
        assert!(parse_line("/media image").is_err());
    }

    #[test]
    fn parses_media_with_and_without_caption() {
        assert_eq!(
            parse_line("/media image https://cdn.example.org/a.png mi perro").expect("media"),
            InputAction::Media {
                kind: MediaKind::Image,
                url: "https://cdn.example.org/a.png".into(),
                caption: Some("mi perro".into()),
            }
        );
        assert_eq!(
            parse_line("/media AUDIO https://cdn.example.org/b.ogg").expect("media"),
            InputAction::Media {
                kind: MediaKind::Audio,
                url: "https://cdn.example.org/b.ogg".into(),
                caption: None,
            }
        );
    }

    #[test]
    fn rejects_unknown_kind_and_command() {
        assert_eq!(
            parse_line("/media gif https://x.org/a.gif"),
            Err(InputError::UnknownMediaKind("gif".into()))
        );
        assert_eq!(
            parse_line("/dance"),
            Err(InputError::UnknownCommand("dance".into()))
        );
    }
}
