//! Console command processor.
//!
//! Built-in commands work directly on the drives owned by the BDOS. Anything
//! else is looked up as `NAME.COM`, loaded into the transient program area
//! and handed back to the caller to run. `ED`, `BASIC` and `EXIT` also hand
//! control back, since the caller owns the interactive modes.

use tracing::{debug, info};

use crate::assembler;
use crate::bdos::{self, Bdos, Console};
use crate::disk::{self, DiskError};
use crate::memory::Memory;
use crate::metrics;

pub const TPA_START: u16 = 0x0100;
pub const DEFAULT_FCB: u16 = 0x005C;
pub const COMMAND_TAIL: u16 = 0x0080;

const HELP: &str = "\
Built-in commands:\r
  DIR / LS [pattern]    list files\r
  TYPE / CAT file       show a text file\r
  ERA / DEL / RM pat    delete files\r
  REN new=old           rename a file\r
  ASM file              assemble FILE.ASM into FILE.COM\r
  SAVE n file           save n pages from 0100H\r
  ED / EDIT file        line editor\r
  BASIC                 BASIC interpreter\r
  EXIT / QUIT           end the session\r
  X:                    switch to drive X\r
  HELP / ?              this text\r
Any other name runs NAME.COM.\r
";

/// What the caller should do after a command line has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Built-in command finished, or nothing to do
    Done,
    /// A program was loaded and should be started at `entry`
    Run { entry: u16 },
    /// Open the line editor on `name`
    Edit { drive: usize, name: String },
    Basic,
    Exit,
}

pub fn prompt(bdos: &Bdos) -> String {
    format!("{}>", drive_letter(bdos.current_drive()))
}

fn drive_letter(index: usize) -> char {
    (b'A' + index as u8) as char
}

/// Handle one command line.
pub fn execute(line: &str, bdos: &mut Bdos, memory: &mut Memory, console: &mut dyn Console) -> CommandOutcome {
    let line = line.trim();
    let (command, tail) = match line.find(char::is_whitespace) {
        Some(index) => (&line[..index], line[index..].trim()),
        None => (line, ""),
    };
    if command.is_empty() {
        return CommandOutcome::Done;
    }

    let command = command.to_ascii_uppercase();
    debug!("ccp command {} {:?}", command, tail);

    match command.as_str() {
        "DIR" | "LS" => dir(tail, bdos, console),
        "TYPE" | "CAT" => type_file(tail, bdos, console),
        "ERA" | "DEL" | "RM" => erase(tail, bdos, console),
        "REN" | "RENAME" => rename(tail, bdos, console),
        "ASM" => assemble_file(tail, bdos, console),
        "SAVE" => save(tail, bdos, memory, console),
        "ED" | "EDIT" => return edit(tail, bdos, console),
        "BASIC" => return CommandOutcome::Basic,
        "EXIT" | "QUIT" => return CommandOutcome::Exit,
        "HELP" | "?" => console.put_str(HELP.as_bytes()),
        drive if is_drive_switch(drive) => switch_drive(drive, bdos, console),
        _ => return load_program(&command, tail, bdos, memory, console),
    }
    CommandOutcome::Done
}

fn print_line(console: &mut dyn Console, text: &str) {
    console.put_str(text.as_bytes());
    console.put_str(b"\r\n");
}

fn is_drive_switch(command: &str) -> bool {
    let bytes = command.as_bytes();
    bytes.len() == 2 && bytes[1] == b':' && (b'A'..=b'P').contains(&bytes[0])
}

fn switch_drive(command: &str, bdos: &mut Bdos, console: &mut dyn Console) {
    let index = (command.as_bytes()[0] - b'A') as usize;
    if bdos.select_drive(index).is_err() {
        print_line(console, &format!("NO DRIVE {}", command));
    }
}

/// Split an optional `X:` prefix off a file argument.
fn drive_and_name(arg: &str, bdos: &Bdos) -> Option<(usize, String)> {
    let arg = arg.trim().to_ascii_uppercase();
    let bytes = arg.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' {
        let index = bytes[0].checked_sub(b'A')? as usize;
        if index >= bdos.drive_count() {
            return None;
        }
        Some((index, arg[2..].to_string()))
    } else {
        Some((bdos.current_drive(), arg))
    }
}

fn matching_files(bdos: &Bdos, drive: usize, pattern: &str) -> Vec<String> {
    bdos.drive(drive)
        .map(|d| d.list_files())
        .unwrap_or_default()
        .into_iter()
        .filter(|name| disk::matches_pattern(name, pattern))
        .collect()
}

fn dir(args: &str, bdos: &Bdos, console: &mut dyn Console) {
    let pattern = if args.is_empty() { "*.*" } else { args };
    let Some((drive, pattern)) = drive_and_name(pattern, bdos) else {
        print_line(console, "NO DRIVE");
        return;
    };
    let pattern = if pattern.is_empty() { "*.*".to_string() } else { pattern };

    let files = matching_files(bdos, drive, &pattern);
    if files.is_empty() {
        print_line(console, "NO FILE");
        return;
    }
    for name in files {
        let raw = disk::fcb_name(&name);
        let entry = format!(
            "{}: {} {}",
            drive_letter(drive),
            String::from_utf8_lossy(&raw[..disk::NAME_LEN]),
            String::from_utf8_lossy(&raw[disk::NAME_LEN..])
        );
        print_line(console, &entry);
    }
}

fn type_file(args: &str, bdos: &Bdos, console: &mut dyn Console) {
    if args.is_empty() {
        print_line(console, "USAGE: TYPE file");
        return;
    }
    let data = drive_and_name(args, bdos)
        .and_then(|(drive, name)| bdos.drive(drive)?.get_file(&name).map(|data| data.to_vec()));
    let Some(data) = data else {
        print_line(console, "NO FILE");
        return;
    };

    // Text ends at the first ^Z
    let text: Vec<u8> = data.into_iter().take_while(|&b| b != 0x1A).collect();
    console.put_str(&text);
    if !text.ends_with(b"\n") {
        console.put_str(b"\r\n");
    }
}

fn erase(args: &str, bdos: &mut Bdos, console: &mut dyn Console) {
    if args.is_empty() {
        print_line(console, "USAGE: ERA pattern");
        return;
    }
    let Some((drive, pattern)) = drive_and_name(args, bdos) else {
        print_line(console, "NO DRIVE");
        return;
    };

    let files = matching_files(bdos, drive, &pattern);
    if files.is_empty() {
        print_line(console, "NO FILE");
        return;
    }
    if let Some(target) = bdos.drive_mut(drive) {
        for name in &files {
            if let Err(err) = target.delete_file(name) {
                print_line(console, &format!("ERROR: {}", err));
            }
        }
    }
}

fn rename(args: &str, bdos: &mut Bdos, console: &mut dyn Console) {
    let Some((new_name, old_name)) = args.split_once('=') else {
        print_line(console, "USAGE: REN new=old");
        return;
    };
    let (Some((drive, new_name)), Some((_, old_name))) =
        (drive_and_name(new_name, bdos), drive_and_name(old_name, bdos))
    else {
        print_line(console, "NO DRIVE");
        return;
    };

    let result = match bdos.drive_mut(drive) {
        Some(target) => target.rename_file(&old_name, &new_name),
        None => Err(DiskError::NotFound(old_name.clone())),
    };
    match result {
        Ok(()) => {}
        Err(DiskError::NotFound(_)) => print_line(console, "NO FILE"),
        Err(DiskError::AlreadyExists(_)) => print_line(console, "FILE EXISTS"),
        Err(err) => print_line(console, &format!("ERROR: {}", err)),
    }
}

fn assemble_file(args: &str, bdos: &mut Bdos, console: &mut dyn Console) {
    if args.is_empty() {
        print_line(console, "USAGE: ASM file");
        return;
    }
    let Some((drive, name)) = drive_and_name(args, bdos) else {
        print_line(console, "NO DRIVE");
        return;
    };
    let base = name.split('.').next().unwrap_or_default().to_string();
    let source_name = if name.contains('.') { name.clone() } else { format!("{}.ASM", base) };
    let output_name = format!("{}.COM", base);

    let Some(source) = bdos.drive(drive).and_then(|d| d.get_file(&source_name)) else {
        print_line(console, "NO FILE");
        return;
    };
    let source: String = String::from_utf8_lossy(source)
        .chars()
        .take_while(|&c| c != '\u{1A}')
        .collect();

    let assembly = assembler::assemble_at(&source, TPA_START);
    metrics::record_assembly(assembly.is_ok());
    if !assembly.is_ok() {
        for diagnostic in &assembly.diagnostics {
            print_line(console, &diagnostic.to_string());
        }
        print_line(console, &format!("{} ERROR(S)", assembly.diagnostics.len()));
        return;
    }
    if assembly.origin < TPA_START {
        print_line(console, "ORG BELOW 0100H");
        return;
    }

    // A .COM image always starts at 0100H
    let mut image = vec![0; (assembly.origin - TPA_START) as usize];
    image.extend_from_slice(&assembly.bytes);
    let size = image.len();

    let saved = bdos
        .drive_mut(drive)
        .map(|target| target.save_file(&output_name, image));
    match saved {
        Some(Ok(())) => {
            info!("assembled {} into {} ({} bytes)", source_name, output_name, size);
            print_line(console, &format!("{}: {} BYTES", output_name, size));
        }
        Some(Err(err)) => print_line(console, &format!("ERROR: {}", err)),
        None => print_line(console, "NO DRIVE"),
    }
}

/// `SAVE n FILE`: write `n` 256 byte pages starting at 0100H.
fn save(args: &str, bdos: &mut Bdos, memory: &Memory, console: &mut dyn Console) {
    let mut parts = args.split_whitespace();
    let (Some(Ok(pages)), Some(file)) = (parts.next().map(str::parse::<u8>), parts.next()) else {
        print_line(console, "USAGE: SAVE pages file");
        return;
    };
    let Some((drive, name)) = drive_and_name(file, bdos) else {
        print_line(console, "NO DRIVE");
        return;
    };
    if disk::normalize_name(&name).is_err() || !disk::is_short_name(&name) {
        print_line(console, &format!("{}?", name));
        return;
    }

    let image = match memory.dump(TPA_START, pages as usize * 256) {
        Ok(image) => image,
        Err(err) => {
            print_line(console, &format!("ERROR: {}", err));
            return;
        }
    };
    let saved = bdos.drive_mut(drive).map(|target| target.save_file(&name, image));
    match saved {
        Some(Ok(())) => info!("saved {} pages to {}", pages, name),
        Some(Err(err)) => print_line(console, &format!("ERROR: {}", err)),
        None => print_line(console, "NO DRIVE"),
    }
}

fn edit(args: &str, bdos: &Bdos, console: &mut dyn Console) -> CommandOutcome {
    let file = args.split_whitespace().next().unwrap_or("UNTITLED");
    let Some((drive, name)) = drive_and_name(file, bdos) else {
        print_line(console, "NO DRIVE");
        return CommandOutcome::Done;
    };
    if disk::normalize_name(&name).is_err() || !disk::is_short_name(&name) {
        print_line(console, &format!("{}?", name));
        return CommandOutcome::Done;
    }
    CommandOutcome::Edit { drive, name }
}

fn load_program(command: &str, tail: &str, bdos: &mut Bdos, memory: &mut Memory, console: &mut dyn Console) -> CommandOutcome {
    let unknown = |console: &mut dyn Console| {
        print_line(console, &format!("{}?", command));
        CommandOutcome::Done
    };

    let Some((drive, name)) = drive_and_name(command, bdos) else {
        return unknown(console);
    };
    if disk::normalize_name(&name).is_err() || (name.contains('.') && !name.ends_with(".COM")) {
        return unknown(console);
    }
    let file_name = if name.ends_with(".COM") { name } else { format!("{}.COM", name) };

    let Some(image) = bdos.drive(drive).and_then(|d| d.get_file(&file_name)).map(|data| data.to_vec()) else {
        return unknown(console);
    };
    if let Err(err) = memory.load(TPA_START, &image) {
        print_line(console, &format!("ERROR: {}", err));
        return CommandOutcome::Done;
    }

    prepare_command_tail(memory, tail);
    info!("loaded {} ({} bytes)", file_name, image.len());
    CommandOutcome::Run { entry: TPA_START }
}

/// Fill the default FCB and the command tail buffer the way a program
/// expects them on entry.
fn prepare_command_tail(memory: &mut Memory, tail: &str) {
    let tail = tail.to_ascii_uppercase();
    let first = tail.split_whitespace().next().unwrap_or("");
    let (drive_byte, name) = match first.as_bytes() {
        [letter, b':', ..] if letter.is_ascii_uppercase() => (letter - b'A' + 1, &first[2..]),
        _ => (0, first),
    };
    bdos::write_fcb(memory, DEFAULT_FCB, drive_byte, name);

    let text = if tail.is_empty() { String::new() } else { format!(" {}", tail) };
    let bytes = &text.as_bytes()[..text.len().min(127)];
    memory.write(COMMAND_TAIL, bytes.len() as u8);
    for (i, &byte) in bytes.iter().enumerate() {
        memory.write(COMMAND_TAIL + 1 + i as u16, byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Drive, MemoryDrive};

    #[derive(Default)]
    struct Screen(Vec<u8>);

    impl Console for Screen {
        fn put_char(&mut self, ch: u8) {
            self.0.push(ch);
        }

        fn get_char(&mut self) -> Option<u8> {
            None
        }
    }

    impl Screen {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0).into_owned()
        }
    }

    fn setup() -> (Bdos, Memory, Screen) {
        let mut a = MemoryDrive::new();
        a.save_file("HELLO.TXT", b"Hello\r\nWorld\r\n\x1A\x1A".to_vec()).unwrap();
        a.save_file("PROG.ASM", b"MVI A,5\r\nHLT\r\n".to_vec()).unwrap();
        a.save_file("BAD.ASM", b"MVI A,5\r\nBOGUS\r\n".to_vec()).unwrap();
        let drives: Vec<Box<dyn Drive>> = vec![Box::new(a), Box::new(MemoryDrive::new())];
        (Bdos::new(drives), Memory::new(), Screen::default())
    }

    fn run(line: &str) -> (CommandOutcome, Bdos, Memory, String) {
        let (mut bdos, mut memory, mut screen) = setup();
        let outcome = execute(line, &mut bdos, &mut memory, &mut screen);
        (outcome, bdos, memory, screen.text())
    }

    #[test]
    fn test_dir() {
        let (outcome, _, _, output) = run("dir");

        assert_eq!(outcome, CommandOutcome::Done);
        assert_eq!(output, "A: BAD      ASM\r\nA: HELLO    TXT\r\nA: PROG     ASM\r\n");
    }

    #[test]
    fn test_dir_with_pattern_and_empty_drive() {
        let (_, _, _, output) = run("LS *.TXT");
        assert_eq!(output, "A: HELLO    TXT\r\n");

        let (_, _, _, output) = run("DIR B:");
        assert_eq!(output, "NO FILE\r\n");
    }

    #[test]
    fn test_type_stops_at_eof_marker() {
        let (_, _, _, output) = run("type hello.txt");
        assert_eq!(output, "Hello\r\nWorld\r\n");

        let (_, _, _, output) = run("CAT MISSING.TXT");
        assert_eq!(output, "NO FILE\r\n");
    }

    #[test]
    fn test_erase_and_rename() {
        let (mut bdos, mut memory, mut screen) = setup();

        execute("ERA *.ASM", &mut bdos, &mut memory, &mut screen);
        execute("REN GREETING.TXT=HELLO.TXT", &mut bdos, &mut memory, &mut screen);

        assert_eq!(bdos.current().list_files(), vec!["GREETING.TXT"]);
        assert_eq!(screen.text(), "");

        execute("REN X.TXT=HELLO.TXT", &mut bdos, &mut memory, &mut screen);
        assert_eq!(screen.text(), "NO FILE\r\n");
    }

    #[test]
    fn test_drive_switch_and_prompt() {
        let (mut bdos, mut memory, mut screen) = setup();
        assert_eq!(prompt(&bdos), "A>");

        execute("b:", &mut bdos, &mut memory, &mut screen);
        assert_eq!(prompt(&bdos), "B>");

        execute("C:", &mut bdos, &mut memory, &mut screen);
        assert_eq!(prompt(&bdos), "B>");
        assert_eq!(screen.text(), "NO DRIVE C:\r\n");
    }

    #[test]
    fn test_asm_writes_com_file() {
        let (mut bdos, mut memory, mut screen) = setup();

        execute("ASM PROG", &mut bdos, &mut memory, &mut screen);

        assert_eq!(screen.text(), "PROG.COM: 3 BYTES\r\n");
        assert_eq!(bdos.current().get_file("PROG.COM"), Some(&[0x3E, 0x05, 0x76][..]));
    }

    #[test]
    fn test_asm_reports_diagnostics() {
        let (mut bdos, mut memory, mut screen) = setup();

        execute("ASM BAD.ASM", &mut bdos, &mut memory, &mut screen);

        assert_eq!(screen.text(), "line 2: unknown mnemonic BOGUS\r\n1 ERROR(S)\r\n");
        assert!(bdos.current().get_file("BAD.COM").is_none());
    }

    #[test]
    fn test_run_program_loads_com_file() {
        let (mut bdos, mut memory, mut screen) = setup();
        execute("ASM PROG", &mut bdos, &mut memory, &mut screen);

        let outcome = execute("prog b:data.txt", &mut bdos, &mut memory, &mut screen);

        assert_eq!(outcome, CommandOutcome::Run { entry: TPA_START });
        assert_eq!(memory.dump(TPA_START, 3).unwrap(), vec![0x3E, 0x05, 0x76]);
        assert_eq!(memory.read(DEFAULT_FCB), 2);
        assert_eq!(memory.dump(DEFAULT_FCB + 1, 11).unwrap(), b"DATA    TXT".to_vec());
        assert_eq!(memory.read(COMMAND_TAIL), 11);
        assert_eq!(memory.dump(COMMAND_TAIL + 1, 11).unwrap(), b" B:DATA.TXT".to_vec());
    }

    #[test]
    fn test_unknown_command() {
        let (outcome, _, _, output) = run("frobnicate now");

        assert_eq!(outcome, CommandOutcome::Done);
        assert_eq!(output, "FROBNICATE?\r\n");
    }

    #[test]
    fn test_help() {
        let (_, _, _, output) = run("?");
        assert!(output.starts_with("Built-in commands:"));
        assert!(output.contains("ASM file"));
        assert!(output.contains("ED / EDIT file"));
    }

    #[test]
    fn test_save_writes_pages_from_tpa() {
        let (mut bdos, mut memory, mut screen) = setup();
        memory.load(TPA_START, &[0x3E, 0x07, 0x76]).unwrap();
        memory.write(TPA_START + 0x1FF, 0xAA);

        let outcome = execute("SAVE 2 B:SEVEN.COM", &mut bdos, &mut memory, &mut screen);

        assert_eq!(outcome, CommandOutcome::Done);
        assert_eq!(screen.text(), "");
        let image = bdos.drive(1).unwrap().get_file("SEVEN.COM").unwrap();
        assert_eq!(image.len(), 512);
        assert_eq!(&image[..3], &[0x3E, 0x07, 0x76]);
        assert_eq!(image[0x1FF], 0xAA);
    }

    #[test]
    fn test_save_usage() {
        let (_, _, _, output) = run("SAVE X.COM");
        assert_eq!(output, "USAGE: SAVE pages file\r\n");

        let (_, _, _, output) = run("SAVE 300 X.COM");
        assert_eq!(output, "USAGE: SAVE pages file\r\n");

        let (_, bdos, _, output) = run("SAVE 0 EMPTY.COM");
        assert_eq!(output, "");
        assert_eq!(bdos.current().get_file("EMPTY.COM"), Some(&[][..]));
    }

    #[test]
    fn test_interactive_commands_hand_back() {
        let (outcome, _, _, _) = run("ed b:notes.txt");
        assert_eq!(outcome, CommandOutcome::Edit { drive: 1, name: "NOTES.TXT".to_string() });

        let (outcome, _, _, _) = run("EDIT");
        assert_eq!(outcome, CommandOutcome::Edit { drive: 0, name: "UNTITLED".to_string() });

        let (outcome, _, _, output) = run("ED VERYLONGNAME.TXT");
        assert_eq!(outcome, CommandOutcome::Done);
        assert_eq!(output, "VERYLONGNAME.TXT?\r\n");

        assert_eq!(run("basic").0, CommandOutcome::Basic);
        assert_eq!(run("EXIT").0, CommandOutcome::Exit);
        assert_eq!(run("quit").0, CommandOutcome::Exit);
    }
}
