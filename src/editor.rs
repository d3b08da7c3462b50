//! Line editor started by `ED`.
//!
//! The editor is fed one console line at a time. In command mode a line is
//! a one-letter command; in insert mode each line is inserted at the
//! cursor until an empty line returns to command mode. `S` writes the
//! buffer back to the drive it was opened from.

use tracing::{debug, info};

use crate::bdos::{Bdos, Console};

const EOF_MARK: u8 = 0x1A;

const HELP: &str = "\
ED Commands:\r
  I        - Insert mode\r
  D n      - Delete line n\r
  L        - List all lines\r
  L n-m    - List lines n to m\r
  S        - Save file\r
  Q        - Quit editor\r
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorStatus {
    Editing,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    Insert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEditor {
    drive: usize,
    file_name: String,
    lines: Vec<String>,
    /// Index the next inserted line goes to
    cursor: usize,
    mode: Mode,
}

impl LineEditor {
    /// Open `file_name` on `drive`, reading it when it exists, and print
    /// the banner and first prompt.
    pub fn open(drive: usize, file_name: &str, bdos: &Bdos, console: &mut dyn Console) -> Self {
        let lines = bdos
            .drive(drive)
            .and_then(|d| d.get_file(file_name))
            .map(split_lines)
            .unwrap_or_default();
        info!("editing {} ({} lines)", file_name, lines.len());

        let editor = LineEditor {
            drive,
            file_name: file_name.to_string(),
            cursor: lines.len(),
            lines,
            mode: Mode::Command,
        };
        print_line(console, "ED - CP/M Text Editor");
        print_line(console, &format!("Editing: {}", editor.file_name));
        print_line(console, "Commands: I=Insert, D=Delete, L=List, S=Save, Q=Quit");
        print_line(console, "");
        editor.prompt(console);
        editor
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Handle one line of input and print the next prompt.
    pub fn handle_line(&mut self, line: &str, bdos: &mut Bdos, console: &mut dyn Console) -> EditorStatus {
        match self.mode {
            Mode::Insert if line.is_empty() => self.mode = Mode::Command,
            Mode::Insert => {
                self.lines.insert(self.cursor, line.to_string());
                self.cursor += 1;
            }
            Mode::Command => {
                if self.command(line, bdos, console) == EditorStatus::Quit {
                    debug!("leaving editor for {}", self.file_name);
                    return EditorStatus::Quit;
                }
            }
        }
        self.prompt(console);
        EditorStatus::Editing
    }

    fn command(&mut self, line: &str, bdos: &mut Bdos, console: &mut dyn Console) -> EditorStatus {
        let input = line.trim().to_ascii_uppercase();
        let Some(command) = input.chars().next() else {
            return EditorStatus::Editing;
        };
        let arg = input[command.len_utf8()..].trim();

        match command {
            'I' => {
                print_line(console, "Enter text (empty line to exit insert mode):");
                self.mode = Mode::Insert;
            }
            'D' => self.delete(arg, console),
            'L' => self.list(arg, console),
            'S' => self.save(bdos, console),
            'Q' => return EditorStatus::Quit,
            'H' => console.put_str(HELP.as_bytes()),
            other => print_line(console, &format!("Unknown command: {}", other)),
        }
        EditorStatus::Editing
    }

    fn prompt(&self, console: &mut dyn Console) {
        match self.mode {
            Mode::Command => console.put_char(b'*'),
            Mode::Insert => console.put_str(format!("{:4}: ", self.cursor + 1).as_bytes()),
        }
    }

    fn delete(&mut self, arg: &str, console: &mut dyn Console) {
        match arg.parse::<usize>() {
            Ok(number) if (1..=self.lines.len()).contains(&number) => {
                self.lines.remove(number - 1);
                if number <= self.cursor {
                    self.cursor -= 1;
                }
                print_line(console, &format!("Deleted line {}", number));
            }
            _ => print_line(console, "Invalid line number"),
        }
    }

    fn list(&self, arg: &str, console: &mut dyn Console) {
        let (mut start, mut end) = (0, self.lines.len());
        let range = match arg.split_once('-') {
            Some((from, to)) => from.trim().parse::<usize>().ok().zip(to.trim().parse::<usize>().ok()),
            None => arg.parse::<usize>().ok().map(|n| (n, n)),
        };
        if let Some((from, to)) = range {
            start = from.saturating_sub(1);
            end = to.min(self.lines.len());
        }

        for (index, text) in self.lines.iter().enumerate().take(end).skip(start) {
            print_line(console, &format!("{:4}: {}", index + 1, text));
        }
    }

    fn save(&self, bdos: &mut Bdos, console: &mut dyn Console) {
        let mut data = Vec::new();
        for text in &self.lines {
            data.extend_from_slice(text.as_bytes());
            data.extend_from_slice(b"\r\n");
        }
        data.push(EOF_MARK);

        let saved = bdos
            .drive_mut(self.drive)
            .map(|drive| drive.save_file(&self.file_name, data));
        match saved {
            Some(Ok(())) => {
                info!("saved {} lines to {}", self.lines.len(), self.file_name);
                print_line(console, &format!("Saved {} lines to {}", self.lines.len(), self.file_name));
            }
            Some(Err(err)) => print_line(console, &format!("ERROR: {}", err)),
            None => print_line(console, "NO DRIVE"),
        }
    }
}

/// Text lines of a CP/M file: up to the first ^Z, CRLF or LF separated.
pub fn split_lines(data: &[u8]) -> Vec<String> {
    let text: Vec<u8> = data.iter().copied().take_while(|&b| b != EOF_MARK).collect();
    String::from_utf8_lossy(&text)
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

fn print_line(console: &mut dyn Console, text: &str) {
    console.put_str(text.as_bytes());
    console.put_str(b"\r\n");
}
