//! VGA text-mode console.
//!
//! A cursor-based writer over the text buffer at `0xb8000`: output starts
//! at the top of the screen, advances line by line and only starts
//! scrolling once the cursor reaches the bottom row. Used for boot
//! messages and `sys_write` output through `print!`/`println!`.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;
use x86_64::instructions::interrupts;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

/// Define a color for the text displayed on the screen.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// A foreground/background color pair packed the way the VGA hardware wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    /// Create a new `ColorCode` from a foreground and a background color.
    #[must_use]
    pub const fn new(foreground: Color, background: Color) -> Self {
        Self((background as u8) << 4 | (foreground as u8))
    }
}

/// One character cell of the text buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ScreenChar {
    /// Code-page 437 byte displayed in the cell.
    pub ascii_character: u8,
    /// Colors of the cell.
    pub color_code: ColorCode,
}

/// The memory mapped VGA text buffer.
pub struct Buffer {
    /// Character cells, accessed through `Volatile` so the compiler never
    /// elides the stores.
    pub chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

/// Writer that tracks a cursor position and scrolls at the bottom row.
pub struct Writer {
    row: usize,
    column: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

impl Writer {
    /// Write a single byte at the cursor.
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.advance_line(),
            b'\r' => self.column = 0,
            character => {
                if self.column >= BUFFER_WIDTH {
                    self.advance_line();
                }

                let cell = ScreenChar {
                    ascii_character: character,
                    color_code: self.color_code,
                };
                self.buffer.chars[self.row][self.column].write(cell);
                self.column += 1;
            }
        }
    }

    /// Write a string, replacing non-printable bytes with `0xfe`.
    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' | b'\r' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Current cursor position as `(row, column)`.
    #[must_use]
    pub const fn cursor(&self) -> (usize, usize) {
        (self.row, self.column)
    }

    /// Read back one cell, used by the display tests.
    #[must_use]
    pub fn char_at(&self, row: usize, col: usize) -> ScreenChar {
        self.buffer.chars[row][col].read()
    }

    /// Blank the whole screen and park the cursor at the top left.
    pub fn reset(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.row = 0;
        self.column = 0;
    }

    /// Move the cursor to the start of the next line, scrolling the screen
    /// up one row once the bottom is reached.
    fn advance_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }

        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let cell = self.buffer.chars[row][col].read();
                self.buffer.chars[row - 1][col].write(cell);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
    }

    /// Fill a row with blank characters.
    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    /// Global instance of the VGA buffer writer.
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        row: 0,
        column: 0,
        color_code: ColorCode::new(Color::LightGreen, Color::Black),

        // SAFETY:
        // The VGA text buffer is identity mapped at 0xb8000 by the bootloader.
        buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
    });
}

/// Blank the screen, e.g. before the boot banner.
pub fn clear() {
    interrupts::without_interrupts(|| {
        WRITER.lock().reset();
    });
}

/// Copy of the std print! macro that redirect our internal _print function.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::vga_buffer::_print(format_args!($($arg)*)));
}

/// Copy of the std println! macro that redirect our internal _print function.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // The syscall layer prints on behalf of user programs; keep an
    // interrupt from re-entering while the writer lock is held.
    interrupts::without_interrupts(|| {
        #[expect(
            clippy::expect_used,
            reason = "We should be able to write inside the vga frame buffer."
        )]
        WRITER
            .lock()
            .write_fmt(args)
            .expect("Failed to write to the vga buffer.");
    });
}

#[cfg(test)]
mod tests {
    use x86_64::instructions::interrupts;

    use super::WRITER;

    #[test_case]
    fn test_when_printing_many_lines_should_not_panic() {
        for _ in 0..200 {
            println!("test many print output.");
        }
    }

    #[test_case]
    fn test_written_line_lands_at_the_cursor() {
        let line = "Some line that fits on a single line";

        interrupts::without_interrupts(|| {
            let mut writer = WRITER.lock();

            writer.write_byte(b'\n'); // start on a fresh line
            let (row, _) = writer.cursor();
            writer.write_string(line);

            for (i, c) in line.chars().enumerate() {
                let screen_char = writer.char_at(row, i);
                assert_eq!(
                    char::from(screen_char.ascii_character),
                    c,
                    "Character mismatch at position {i}.",
                );
            }
        });
    }

    #[test_case]
    fn test_carriage_return_rewinds_the_column() {
        interrupts::without_interrupts(|| {
            let mut writer = WRITER.lock();

            writer.write_byte(b'\n');
            let (row, _) = writer.cursor();
            writer.write_string("XY\rZ");

            assert_eq!(
                char::from(writer.char_at(row, 0).ascii_character),
                'Z',
                "A carriage return must rewind to column 0.",
            );
            assert_eq!(
                char::from(writer.char_at(row, 1).ascii_character),
                'Y',
                "Characters past the rewritten column are untouched.",
            );
        });
    }
}
