/*
 * Created on Mon Jan 15 2024
 *
 * This file is a part of Skyflash
 * Skyflash is a flash-optimized free and open-source embedded key/value
 * storage core written by Sayan Nandan ("the Author") with the vision
 * to provide durable, transactional containers of variable-sized records
 * without compromising on performance or concurrency
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

#[macro_export]
macro_rules! consts {
    ($($(#[$attr:meta])* $ident:ident : $ty:ty = $expr:expr;)*) => {
        $(
            $(#[$attr])*
            const $ident: $ty = $expr;
        )*
    };
    ($($(#[$attr:meta])* $vis:vis $ident:ident : $ty:ty = $expr:expr;)*) => {
        $(
            $(#[$attr])*
            $vis const $ident: $ty = $expr;
        )*
    };
}

#[macro_export]
/// Log at error level and terminate. This is the FATAL path: it is only taken when
/// continuing would corrupt on-flash state (for example, running a shard without
/// directory space)
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        ::std::process::abort();
    }};
}

